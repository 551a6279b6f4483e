use dualcam_core::gain::celsius_to_ticks;
use dualcam_core::{FusionType, GainParams, OverexposureParams, Resolution, Resolutions, Rotation};
use dualcam_hw::{AlignOffset, CameraVariant, ControllerConfig, UsbId, DEFAULT_AMPLIFY_MULTIPLE};
use std::str::FromStr;
use std::time::Duration;

/// Which message bus the control interface is served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Feed composition: ir-only, visible-only, external-visible or manual-aligned.
    pub variant: CameraVariant,
    /// Per-plane resolutions before the variant zeroes absent planes.
    pub resolutions: Resolutions,
    pub fps: u32,
    pub rotation: Rotation,
    pub amplify_multiple: u32,
    pub amplify: bool,
    pub fusion: FusionType,
    pub auto_gain: bool,
    pub overexposure_guard: bool,
    pub gain: GainParams,
    pub protection: OverexposureParams,
    /// Pause between disconnect and reopen after a restart request.
    pub restart_delay: Duration,
    /// sysfs scan period of the hotplug poller.
    pub poll_interval: Duration,
    /// Start preview as soon as every device of the variant is open.
    pub autostart: bool,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `DUALCAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| get(key).map(|v| v != "0").unwrap_or(default);

        let ir = env_parse(&get, "DUALCAM_IR_DEVICE", UsbId::new(0x0bda, 0x5830));
        let visible = env_parse(&get, "DUALCAM_VISIBLE_DEVICE", UsbId::new(0x0bda, 0x3901));
        let combined = env_parse(&get, "DUALCAM_COMBINED_DEVICE", UsbId::new(0x0bda, 0x5840));
        let offset = AlignOffset {
            dx: env_parse(&get, "DUALCAM_ALIGN_DX", 0i16),
            dy: env_parse(&get, "DUALCAM_ALIGN_DY", 0i16),
        };

        let variant_name = get("DUALCAM_VARIANT").unwrap_or_else(|| "manual-aligned".to_string());
        let variant = match variant_name.trim() {
            "ir-only" => CameraVariant::IrOnly { device: ir },
            "visible-only" => CameraVariant::VisibleOnly { device: visible },
            "external-visible" => CameraVariant::ExternalVisible { ir, visible },
            "manual-aligned" => CameraVariant::ManualAligned {
                device: combined,
                offset,
            },
            other => {
                tracing::warn!(variant = other, "unknown DUALCAM_VARIANT; using manual-aligned");
                CameraVariant::ManualAligned {
                    device: combined,
                    offset,
                }
            }
        };

        let base = env_parse(&get, "DUALCAM_RESOLUTION", Resolution::new(256, 192));
        let resolutions = Resolutions::new(
            env_parse(&get, "DUALCAM_SENSOR_RESOLUTION", base),
            env_parse(&get, "DUALCAM_VISIBLE_RESOLUTION", base),
            env_parse(&get, "DUALCAM_DUAL_RESOLUTION", base),
        );

        let fps = env_parse(&get, "DUALCAM_FPS", 15u32).max(1);
        let defaults = GainParams::default();
        let gain = GainParams {
            above_fraction: env_parse(&get, "DUALCAM_GAIN_ABOVE_FRACTION", defaults.above_fraction),
            above_threshold: celsius_to_ticks(env_parse(&get, "DUALCAM_GAIN_ABOVE_CELSIUS", 130.0)),
            below_fraction: env_parse(&get, "DUALCAM_GAIN_BELOW_FRACTION", defaults.below_fraction),
            below_threshold: celsius_to_ticks(env_parse(&get, "DUALCAM_GAIN_BELOW_CELSIUS", 110.0)),
            switch_frame_count: (env_parse(&get, "DUALCAM_GAIN_SWITCH_SECS", 5u32) * fps).max(1),
            waiting_frame_count: env_parse(&get, "DUALCAM_GAIN_COOLDOWN_SECS", 7u32) * fps,
        };
        let protection_defaults = OverexposureParams::default();
        let protection = OverexposureParams {
            pixel_above_proportion: env_parse(
                &get,
                "DUALCAM_OVEREXPOSURE_FRACTION",
                protection_defaults.pixel_above_proportion,
            ),
            low_gain_threshold: celsius_to_ticks(env_parse(&get, "DUALCAM_OVEREXPOSURE_LOW_CELSIUS", 550.0)),
            high_gain_threshold: celsius_to_ticks(env_parse(&get, "DUALCAM_OVEREXPOSURE_HIGH_CELSIUS", 100.0)),
            switch_frame_count: (env_parse(&get, "DUALCAM_OVEREXPOSURE_ENGAGE_SECS", 7u32) * fps).max(1),
            close_frame_count: (env_parse(&get, "DUALCAM_OVEREXPOSURE_RELEASE_SECS", 10u32) * fps).max(1),
        };

        let bus = match get("DUALCAM_SESSION_BUS").as_deref() {
            Some("1") => BusKind::Session,
            _ => BusKind::System,
        };

        Self {
            variant,
            resolutions,
            fps,
            rotation: Rotation::from_degrees(env_parse(&get, "DUALCAM_ROTATION", 0u32)),
            amplify_multiple: env_parse(&get, "DUALCAM_AMPLIFY_MULTIPLE", DEFAULT_AMPLIFY_MULTIPLE),
            amplify: flag("DUALCAM_AMPLIFY", false),
            fusion: env_parse(&get, "DUALCAM_FUSION", FusionType::FusionOnly),
            auto_gain: flag("DUALCAM_AUTO_GAIN", true),
            overexposure_guard: flag("DUALCAM_OVEREXPOSURE_GUARD", true),
            gain,
            protection,
            restart_delay: Duration::from_millis(env_parse(&get, "DUALCAM_RESTART_DELAY_MS", 2000u64)),
            poll_interval: Duration::from_millis(env_parse(&get, "DUALCAM_POLL_INTERVAL_MS", 1000u64)),
            autostart: flag("DUALCAM_AUTOSTART", true),
            bus,
        }
    }

    /// Controller settings derived from this configuration.
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            resolutions: self.resolutions,
            rotation: self.rotation,
            amplify_multiple: self.amplify_multiple,
            amplify: self.amplify,
            fusion: Some(self.fusion),
            gain: self.gain,
            protection: self.protection,
            auto_gain: self.auto_gain,
            overexposure_guard: self.overexposure_guard,
        }
    }
}

fn env_parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable setting; using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert!(matches!(c.variant, CameraVariant::ManualAligned { .. }));
        assert_eq!(c.resolutions, Resolutions::uniform(Resolution::new(256, 192)));
        assert_eq!(c.gain.switch_frame_count, 75);
        assert_eq!(c.gain.waiting_frame_count, 105);
        assert_eq!(c.protection.switch_frame_count, 105);
        assert_eq!(c.protection.close_frame_count, 150);
        assert_eq!(c.gain.above_threshold, celsius_to_ticks(130.0));
        assert_eq!(c.restart_delay, Duration::from_secs(2));
        assert_eq!(c.bus, BusKind::System);
        assert!(c.auto_gain && c.overexposure_guard && c.autostart);
    }

    #[test]
    fn test_variant_and_devices() {
        let c = config(&[
            ("DUALCAM_VARIANT", "external-visible"),
            ("DUALCAM_IR_DEVICE", "0bda:5831"),
            ("DUALCAM_VISIBLE_DEVICE", "0x0bda:0x3902"),
        ]);
        assert_eq!(
            c.variant,
            CameraVariant::ExternalVisible {
                ir: UsbId::new(0x0bda, 0x5831),
                visible: UsbId::new(0x0bda, 0x3902),
            }
        );
    }

    #[test]
    fn test_frame_counts_scale_with_fps() {
        let c = config(&[("DUALCAM_FPS", "25"), ("DUALCAM_GAIN_SWITCH_SECS", "2")]);
        assert_eq!(c.gain.switch_frame_count, 50);
        assert_eq!(c.gain.waiting_frame_count, 175);
    }

    #[test]
    fn test_zero_second_windows_keep_one_frame() {
        let c = config(&[
            ("DUALCAM_GAIN_SWITCH_SECS", "0"),
            ("DUALCAM_GAIN_COOLDOWN_SECS", "0"),
            ("DUALCAM_OVEREXPOSURE_ENGAGE_SECS", "0"),
            ("DUALCAM_OVEREXPOSURE_RELEASE_SECS", "0"),
        ]);
        assert_eq!(c.gain.switch_frame_count, 1);
        assert_eq!(c.gain.waiting_frame_count, 0);
        assert_eq!(c.protection.switch_frame_count, 1);
        assert_eq!(c.protection.close_frame_count, 1);
    }

    #[test]
    fn test_resolution_overrides() {
        let c = config(&[
            ("DUALCAM_RESOLUTION", "320x240"),
            ("DUALCAM_VISIBLE_RESOLUTION", "640x480"),
        ]);
        assert_eq!(c.resolutions.sensor, Resolution::new(320, 240));
        assert_eq!(c.resolutions.visible, Resolution::new(640, 480));
        assert_eq!(c.resolutions.dual, Resolution::new(320, 240));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let c = config(&[
            ("DUALCAM_FPS", "fast"),
            ("DUALCAM_FUSION", "sideways"),
            ("DUALCAM_VARIANT", "triple"),
        ]);
        assert_eq!(c.fps, 15);
        assert_eq!(c.fusion, FusionType::FusionOnly);
        assert!(matches!(c.variant, CameraVariant::ManualAligned { .. }));
    }

    #[test]
    fn test_flags() {
        let c = config(&[
            ("DUALCAM_AUTO_GAIN", "0"),
            ("DUALCAM_AMPLIFY", "1"),
            ("DUALCAM_SESSION_BUS", "1"),
            ("DUALCAM_ROTATION", "90"),
        ]);
        assert!(!c.auto_gain);
        assert!(c.amplify);
        assert_eq!(c.bus, BusKind::Session);
        assert_eq!(c.rotation, Rotation::Deg90);
        assert_eq!(c.controller().fusion, Some(FusionType::FusionOnly));
    }
}
