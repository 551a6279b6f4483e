//! Dual-camera controller: one logical feed over one or two USB endpoints.
//!
//! Per frame, on the capture thread:
//! 1. validate the length against the layout, dropping corrupt frames;
//! 2. demultiplex every plane into preallocated buffers;
//! 3. run the gain and overexposure loops, queueing any IR command;
//! 4. render the branch selected by the fusion type;
//! 5. hand the image and temperature plane to each frame listener;
//! 6. draw the rendered pixels on the surface.
//!
//! Settings live behind their own lock, read once per frame, so they can be
//! changed from any thread (including a listener) without touching the
//! pipeline buffers. Listeners run while the pipeline buffers are borrowed;
//! every public controller method is safe to call from inside one.

use crate::ircmd::{CommandError, IrCommand, IrCommandSink};
use crate::lifecycle::{ConnectionState, DeviceLifecycleManager, LifecycleError};
use crate::session::in_frame_callback;
use crate::sync::{guarded, lock, ListenerSet};
use crate::usb::{SensorChannel, UsbId};
use dualcam_core::{
    FrameLayout, FusionType, GainController, GainParams, GainState, GainStatus, ImageProcessor,
    IspError, OverexposureParams, OverexposureTransition, Plane, PlaneBuffers, Resolution,
    Resolutions, Rotation, SoftwareIsp,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frames per FPS measurement window.
pub const FPS_WINDOW: u32 = 100;

/// Listener calls slower than one frame at 25 Hz are logged.
pub const SLOW_LISTENER: Duration = Duration::from_millis(40);

pub const DEFAULT_AMPLIFY_MULTIPLE: u32 = 2;

/// Display collaborator: takes ARGB pixels and their dimensions.
pub trait RenderSurface: Send + Sync {
    fn draw(&self, pixels: &[u8], width: u32, height: u32);
}

impl<F> RenderSurface for F
where
    F: Fn(&[u8], u32, u32) + Send + Sync,
{
    fn draw(&self, pixels: &[u8], width: u32, height: u32) {
        self(pixels, width, height)
    }
}

/// Per-frame data subscriber. Buffers are only valid for the call.
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, image: &[u8], temperature: &[u8], fps: f64);
}

impl<F> FrameListener for F
where
    F: Fn(&[u8], &[u8], f64) + Send + Sync,
{
    fn on_frame(&self, image: &[u8], temperature: &[u8], fps: f64) {
        self(image, temperature, fps)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("corrupt frame: expected {expected} bytes, got {actual}")]
pub struct FrameCorrupt {
    pub expected: usize,
    pub actual: usize,
}

/// Informational pipeline signals. Every method defaults to a no-op and is
/// called on the capture thread outside the pipeline lock.
pub trait PipelineObserver: Send + Sync {
    /// First frame after each preview start.
    fn on_first_frame(&self) {}
    fn on_frame_corrupt(&self, _error: &FrameCorrupt) {}
    fn on_gain_switch(&self, _status: GainStatus) {}
    fn on_overexposure(&self, _transition: OverexposureTransition) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Pixel offset of the visible image relative to the IR image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlignOffset {
    pub dx: i16,
    pub dy: i16,
}

/// Which endpoints make up the feed. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraVariant {
    /// Single IR sensor; frames carry only the raw IR and temperature planes.
    IrOnly { device: UsbId },
    /// Single visible sensor; frames carry only the raw visible plane.
    VisibleOnly { device: UsbId },
    /// Composite frames from the IR endpoint, with a separate visible camera
    /// streamed alongside.
    ExternalVisible { ir: UsbId, visible: UsbId },
    /// Combined endpoint; the alignment offset is written at preview start.
    ManualAligned { device: UsbId, offset: AlignOffset },
}

impl CameraVariant {
    pub fn name(&self) -> &'static str {
        match self {
            CameraVariant::IrOnly { .. } => "ir-only",
            CameraVariant::VisibleOnly { .. } => "visible-only",
            CameraVariant::ExternalVisible { .. } => "external-visible",
            CameraVariant::ManualAligned { .. } => "manual-aligned",
        }
    }

    /// Session whose frames drive the pipeline.
    pub fn source(&self) -> (UsbId, SensorChannel) {
        match *self {
            CameraVariant::IrOnly { device } => (device, SensorChannel::Ir),
            CameraVariant::VisibleOnly { device } => (device, SensorChannel::Visible),
            CameraVariant::ExternalVisible { ir, .. } => (ir, SensorChannel::Ir),
            CameraVariant::ManualAligned { device, .. } => (device, SensorChannel::Ir),
        }
    }

    /// Sessions streamed alongside the source.
    pub fn companions(&self) -> Vec<(UsbId, SensorChannel)> {
        match *self {
            CameraVariant::ExternalVisible { visible, .. } => vec![(visible, SensorChannel::Visible)],
            CameraVariant::ManualAligned { device, .. } => vec![(device, SensorChannel::Visible)],
            CameraVariant::IrOnly { .. } | CameraVariant::VisibleOnly { .. } => Vec::new(),
        }
    }

    /// Every USB id the feed needs open, source first.
    pub fn devices(&self) -> Vec<UsbId> {
        let mut ids = vec![self.source().0];
        for (id, _) in self.companions() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Frame resolutions with the planes this variant lacks zeroed.
    pub fn resolutions(&self, configured: Resolutions) -> Resolutions {
        match self {
            CameraVariant::IrOnly { .. } => Resolutions::ir_only(configured.sensor),
            CameraVariant::VisibleOnly { .. } => Resolutions::visible_only(configured.visible),
            _ => configured,
        }
    }

    pub fn has_thermal(&self) -> bool {
        !matches!(self, CameraVariant::VisibleOnly { .. })
    }

    fn forced_fusion(&self) -> Option<FusionType> {
        match self {
            CameraVariant::IrOnly { .. } => Some(FusionType::IrOnlyNoFusion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub resolutions: Resolutions,
    /// Output rotation of the fused path.
    pub rotation: Rotation,
    pub amplify_multiple: u32,
    pub amplify: bool,
    /// `None` renders nothing until a fusion type is set.
    pub fusion: Option<FusionType>,
    pub gain: GainParams,
    pub protection: OverexposureParams,
    pub auto_gain: bool,
    pub overexposure_guard: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolutions::uniform(Resolution::new(256, 192)),
            rotation: Rotation::Deg0,
            amplify_multiple: DEFAULT_AMPLIFY_MULTIPLE,
            amplify: false,
            fusion: Some(FusionType::FusionOnly),
            gain: GainParams::default(),
            protection: OverexposureParams::default(),
            auto_gain: true,
            overexposure_guard: true,
        }
    }
}

/// Collaborators the controller is built from.
pub struct ControllerParts {
    pub manager: Arc<DeviceLifecycleManager>,
    pub commands: Arc<dyn IrCommandSink>,
    pub surface: Arc<dyn RenderSurface>,
    pub isp: Arc<dyn ImageProcessor>,
    pub observer: Arc<dyn PipelineObserver>,
}

impl ControllerParts {
    /// Parts with the software ISP and no observer.
    pub fn new(
        manager: Arc<DeviceLifecycleManager>,
        commands: Arc<dyn IrCommandSink>,
        surface: Arc<dyn RenderSurface>,
    ) -> Self {
        Self {
            manager,
            commands,
            surface,
            isp: Arc::new(SoftwareIsp),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_isp(mut self, isp: Arc<dyn ImageProcessor>) -> Self {
        self.isp = isp;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("preview is running")]
    PreviewActive,
    #[error("preview start or stop already in progress")]
    Busy,
    #[error("device {id} is {state}, not open")]
    NotConnected { id: UsbId, state: ConnectionState },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    fusion: Option<FusionType>,
    amplify: bool,
}

/// Render-path scratch buffers, sized once per configuration.
struct RenderBuffers {
    /// Raw IR or visible plane converted to ARGB at native resolution.
    converted: Vec<u8>,
    /// Bytes of `converted` written this frame.
    converted_len: usize,
    scaled: Vec<u8>,
    rotated: Vec<u8>,
}

impl RenderBuffers {
    fn new(res: &Resolutions, multiple: u32) -> Self {
        let native = res.sensor.pixels().max(res.visible.pixels()).max(res.dual.pixels()) * 4;
        let m = multiple.max(1) as usize;
        Self {
            converted: vec![0; native],
            converted_len: 0,
            scaled: vec![0; native * m * m],
            rotated: vec![0; native * m * m],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Nothing,
    Fusion,
    Converted,
    Scaled,
    Rotated,
}

#[derive(Debug, Clone, Copy)]
struct Rendered {
    output: Output,
    res: Resolution,
}

impl Rendered {
    const NOTHING: Self = Self {
        output: Output::Nothing,
        res: Resolution::NONE,
    };

    fn pixels<'a>(&self, planes: &'a PlaneBuffers, bufs: &'a RenderBuffers) -> Option<&'a [u8]> {
        let n = self.res.pixels() * 4;
        match self.output {
            Output::Nothing => None,
            Output::Fusion => Some(planes.get(Plane::Fusion)),
            Output::Converted => Some(&bufs.converted[..n]),
            Output::Scaled => Some(&bufs.scaled[..n]),
            Output::Rotated => Some(&bufs.rotated[..n]),
        }
    }
}

#[derive(Debug, Default)]
struct FpsMeter {
    count: u32,
    window_start: Option<Instant>,
    fps: f64,
}

impl FpsMeter {
    fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return self.fps;
        };
        self.count += 1;
        if self.count >= FPS_WINDOW {
            let secs = now.duration_since(start).as_secs_f64();
            if secs > 0.0 {
                self.fps = f64::from(self.count) / secs;
            }
            tracing::debug!(fps = self.fps, "frame rate");
            self.count = 0;
            self.window_start = Some(now);
        }
        self.fps
    }
}

struct Pipeline {
    layout: FrameLayout,
    planes: PlaneBuffers,
    render: RenderBuffers,
    fps: FpsMeter,
}

impl Pipeline {
    fn new(resolutions: Resolutions, multiple: u32) -> Self {
        let layout = FrameLayout::new(resolutions);
        Self {
            planes: PlaneBuffers::new(&layout),
            render: RenderBuffers::new(&resolutions, multiple),
            layout,
            fps: FpsMeter::default(),
        }
    }
}

#[derive(Debug, Default)]
struct FrameReport {
    switched: Option<GainStatus>,
    overexposure: Option<OverexposureTransition>,
}

struct Shared {
    variant: CameraVariant,
    rotation: Rotation,
    multiple: u32,
    settings: Mutex<Settings>,
    gain: Mutex<GainController>,
    /// Copy of the pipeline layout, readable while a frame holds `pipeline`.
    layout: Mutex<FrameLayout>,
    pipeline: Mutex<Pipeline>,
    /// Frames reach the pipeline only while set.
    delivering: AtomicBool,
    first_frame: AtomicBool,
    fps_reset: AtomicBool,
    listeners: ListenerSet<dyn FrameListener>,
    commands: Arc<dyn IrCommandSink>,
    surface: Arc<dyn RenderSurface>,
    isp: Arc<dyn ImageProcessor>,
    observer: Arc<dyn PipelineObserver>,
    frames: AtomicU64,
    corrupt_frames: AtomicU64,
    companion_frames: AtomicU64,
    fps_bits: AtomicU64,
}

impl Shared {
    fn process(&self, frame: &[u8]) {
        let settings = *lock(&self.settings);
        match self.run_pipeline(frame, settings) {
            Ok(report) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                if self.first_frame.swap(false, Ordering::AcqRel) {
                    tracing::info!(variant = self.variant.name(), "first frame");
                    self.observer.on_first_frame();
                }
                if let Some(status) = report.switched {
                    self.observer.on_gain_switch(status);
                }
                if let Some(transition) = report.overexposure {
                    self.observer.on_overexposure(transition);
                }
            }
            Err(corrupt) => {
                self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(expected = corrupt.expected, actual = corrupt.actual, "corrupt frame dropped");
                self.observer.on_frame_corrupt(&corrupt);
            }
        }
    }

    fn run_pipeline(&self, frame: &[u8], settings: Settings) -> Result<FrameReport, FrameCorrupt> {
        let fusion = self.variant.forced_fusion().or(settings.fusion);
        let mut guard = lock(&self.pipeline);
        let pipeline = &mut *guard;

        let expected = pipeline.layout.frame_len();
        let corrupt = FrameCorrupt {
            expected,
            actual: frame.len(),
        };
        if frame.len() != expected {
            return Err(corrupt);
        }
        pipeline
            .layout
            .demux(frame, &mut pipeline.planes)
            .map_err(|_| corrupt)?;

        if self.fps_reset.swap(false, Ordering::AcqRel) {
            pipeline.fps = FpsMeter::default();
        }
        let fps = pipeline.fps.tick();
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);

        let mut report = FrameReport::default();
        if self.variant.has_thermal() {
            self.run_gain(pipeline.planes.get(Plane::RawTemperature), &mut report);
        }

        let res = pipeline.layout.resolutions();
        pipeline.render.converted_len = 0;
        let rendered = self
            .render(&pipeline.planes, &mut pipeline.render, res, fusion, settings.amplify)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "render failed; frame not displayed");
                Rendered::NOTHING
            });

        let image: &[u8] = if pipeline.layout.span(Plane::Fusion).len > 0 {
            pipeline.planes.get(Plane::Fusion)
        } else {
            &pipeline.render.converted[..pipeline.render.converted_len]
        };
        let temperature = match fusion {
            Some(f) if f.uses_raw_temperature() => pipeline.planes.get(Plane::RawTemperature),
            _ => pipeline.planes.get(Plane::RemappedTemperature),
        };

        for listener in self.listeners.snapshot().iter() {
            let started = Instant::now();
            guarded("frame", || listener.on_frame(image, temperature, fps));
            let elapsed = started.elapsed();
            if elapsed > SLOW_LISTENER {
                tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "slow frame listener");
            }
        }

        if let Some(pixels) = rendered.pixels(&pipeline.planes, &pipeline.render) {
            self.surface.draw(pixels, rendered.res.width, rendered.res.height);
        } else {
            tracing::trace!(?fusion, "no render path; frame not displayed");
        }

        Ok(report)
    }

    fn run_gain(&self, temperature: &[u8], report: &mut FrameReport) {
        let mut gain = lock(&self.gain);
        let outcome = match gain.evaluate(temperature) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(error = %e, "temperature plane rejected");
                return;
            }
        };
        if let Some(status) = outcome.switched {
            let applied = self.send(IrCommand::SetGain(status));
            gain.complete_switch(applied);
            if applied {
                tracing::info!(gain = %status, "gain switched");
                report.switched = Some(status);
            }
        }
        if let Some(transition) = outcome.overexposure {
            let engaged = transition == OverexposureTransition::Engaged;
            self.send(IrCommand::OverexposureProtection(engaged));
            tracing::info!(engaged, "overexposure protection");
            report.overexposure = Some(transition);
        }
        if let Some(status) = outcome.gain_override {
            self.send(IrCommand::SetGain(status));
        }
    }

    fn render(
        &self,
        planes: &PlaneBuffers,
        bufs: &mut RenderBuffers,
        res: Resolutions,
        fusion: Option<FusionType>,
        amplify: bool,
    ) -> Result<Rendered, IspError> {
        match (self.variant, fusion) {
            (CameraVariant::VisibleOnly { .. }, _) => {
                let n = res.visible.pixels() * 4;
                self.isp
                    .rgb24_to_argb(planes.get(Plane::RawVisible), res.visible, &mut bufs.converted[..n])?;
                bufs.converted_len = n;
                self.amplify_converted(bufs, res.visible, amplify)
            }
            (_, None) => Ok(Rendered::NOTHING),
            (_, Some(FusionType::IrOnlyNoFusion)) => {
                let n = res.sensor.pixels() * 4;
                self.isp
                    .yuv422_to_argb(planes.get(Plane::RawIr), res.sensor, &mut bufs.converted[..n])?;
                bufs.converted_len = n;
                self.amplify_converted(bufs, res.sensor, amplify)
            }
            (_, Some(FusionType::FusionOnly | FusionType::IrOnly | FusionType::Custom)) => {
                let mut out = Rendered {
                    output: Output::Fusion,
                    res: res.dual,
                };
                if amplify {
                    let scaled = scaled(res.dual, self.multiple);
                    let n = scaled.pixels() * 4;
                    self.isp.upscale_argb(
                        planes.get(Plane::Fusion),
                        res.dual,
                        self.multiple,
                        &mut bufs.scaled[..n],
                    )?;
                    out = Rendered {
                        output: Output::Scaled,
                        res: scaled,
                    };
                }
                if self.rotation != Rotation::Deg0 {
                    let n = out.res.pixels() * 4;
                    let src: &[u8] = match out.output {
                        Output::Scaled => &bufs.scaled[..n],
                        _ => planes.get(Plane::Fusion),
                    };
                    self.isp
                        .rotate_argb(src, out.res, self.rotation, &mut bufs.rotated[..n])?;
                    out = Rendered {
                        output: Output::Rotated,
                        res: rotated(out.res, self.rotation),
                    };
                }
                Ok(out)
            }
        }
    }

    fn amplify_converted(
        &self,
        bufs: &mut RenderBuffers,
        res: Resolution,
        amplify: bool,
    ) -> Result<Rendered, IspError> {
        if !amplify {
            return Ok(Rendered {
                output: Output::Converted,
                res,
            });
        }
        let scaled = scaled(res, self.multiple);
        let n = scaled.pixels() * 4;
        self.isp
            .upscale_argb(&bufs.converted[..bufs.converted_len], res, self.multiple, &mut bufs.scaled[..n])?;
        Ok(Rendered {
            output: Output::Scaled,
            res: scaled,
        })
    }

    fn send(&self, command: IrCommand) -> bool {
        match self.commands.submit(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(?command, error = %e, "IR command not accepted");
                false
            }
        }
    }
}

fn scaled(res: Resolution, multiple: u32) -> Resolution {
    let m = multiple.max(1);
    Resolution::new(res.width * m, res.height * m)
}

fn rotated(res: Resolution, rotation: Rotation) -> Resolution {
    if rotation.swaps_axes() {
        Resolution::new(res.height, res.width)
    } else {
        res
    }
}

pub struct DualCameraController {
    shared: Arc<Shared>,
    manager: Arc<DeviceLifecycleManager>,
    /// Serializes the start and stop sequences.
    preview_ops: Mutex<()>,
    previewing: AtomicBool,
    /// A listener asked to stop while another thread held `preview_ops`.
    stop_pending: AtomicBool,
}

impl DualCameraController {
    pub fn new(variant: CameraVariant, config: ControllerConfig, parts: ControllerParts) -> Self {
        let resolutions = variant.resolutions(config.resolutions);
        let multiple = config.amplify_multiple.max(1);
        let mut gain = GainController::new(config.gain, config.protection, resolutions.sensor);
        gain.set_auto_gain(config.auto_gain);
        gain.set_overexposure_guard(config.overexposure_guard);
        let pipeline = Pipeline::new(resolutions, multiple);

        tracing::info!(
            variant = variant.name(),
            frame_len = pipeline.layout.frame_len(),
            rotation = config.rotation.degrees(),
            "dual camera controller ready"
        );

        Self {
            shared: Arc::new(Shared {
                variant,
                rotation: config.rotation,
                multiple,
                settings: Mutex::new(Settings {
                    fusion: config.fusion,
                    amplify: config.amplify,
                }),
                gain: Mutex::new(gain),
                layout: Mutex::new(pipeline.layout),
                pipeline: Mutex::new(pipeline),
                delivering: AtomicBool::new(false),
                first_frame: AtomicBool::new(true),
                fps_reset: AtomicBool::new(false),
                listeners: ListenerSet::new(),
                commands: parts.commands,
                surface: parts.surface,
                isp: parts.isp,
                observer: parts.observer,
                frames: AtomicU64::new(0),
                corrupt_frames: AtomicU64::new(0),
                companion_frames: AtomicU64::new(0),
                fps_bits: AtomicU64::new(0f64.to_bits()),
            }),
            manager: parts.manager,
            preview_ops: Mutex::new(()),
            previewing: AtomicBool::new(false),
            stop_pending: AtomicBool::new(false),
        }
    }

    pub fn variant(&self) -> CameraVariant {
        self.shared.variant
    }

    pub fn layout(&self) -> FrameLayout {
        *lock(&self.shared.layout)
    }

    pub fn set_fusion_type(&self, fusion: FusionType) {
        lock(&self.shared.settings).fusion = Some(fusion);
        tracing::info!(%fusion, "fusion type set");
    }

    pub fn fusion_type(&self) -> Option<FusionType> {
        lock(&self.shared.settings).fusion
    }

    pub fn set_amplification(&self, enabled: bool) {
        lock(&self.shared.settings).amplify = enabled;
        tracing::info!(enabled, multiple = self.shared.multiple, "amplification set");
    }

    pub fn amplification(&self) -> bool {
        lock(&self.shared.settings).amplify
    }

    /// Write the gain register and restart the hysteresis counters.
    ///
    /// The controller state changes only once the command channel accepted
    /// the write. While overexposure protection holds the sensor at low gain
    /// the request is recorded and written when protection releases.
    pub fn set_gain_status(&self, status: GainStatus) -> Result<(), ControllerError> {
        let mut gain = lock(&self.shared.gain);
        let previous = gain.clone();
        let Some(write) = gain.set_gain_status(status) else {
            tracing::info!(gain = %status, "gain recorded until overexposure protection releases");
            return Ok(());
        };
        if let Err(e) = self.shared.commands.submit(IrCommand::SetGain(write)) {
            *gain = previous;
            tracing::warn!(gain = %status, error = %e, "manual gain not applied");
            return Err(e.into());
        }
        tracing::info!(gain = %status, "gain set manually");
        Ok(())
    }

    pub fn set_auto_gain(&self, enabled: bool) {
        lock(&self.shared.gain).set_auto_gain(enabled);
    }

    pub fn set_overexposure_guard(&self, enabled: bool) {
        lock(&self.shared.gain).set_overexposure_guard(enabled);
    }

    pub fn gain_state(&self) -> GainState {
        lock(&self.shared.gain).state()
    }

    /// Gain the sensor runs at, including an overexposure override.
    pub fn effective_gain(&self) -> GainStatus {
        lock(&self.shared.gain).effective_gain()
    }

    pub fn protection_engaged(&self) -> bool {
        lock(&self.shared.gain).protection_engaged()
    }

    pub fn add_frame_listener(&self, listener: Arc<dyn FrameListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_frame_listener(&self, listener: &Arc<dyn FrameListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    /// Most recent FPS measurement; 0 until the first window completes.
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.shared.fps_bits.load(Ordering::Relaxed))
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn corrupt_frames(&self) -> u64 {
        self.shared.corrupt_frames.load(Ordering::Relaxed)
    }

    pub fn companion_frames(&self) -> u64 {
        self.shared.companion_frames.load(Ordering::Relaxed)
    }

    pub fn is_previewing(&self) -> bool {
        self.previewing.load(Ordering::Acquire)
    }

    /// Adopt new resolutions. Reallocates every buffer; only while stopped,
    /// and never from a frame listener.
    pub fn reconfigure(&self, resolutions: Resolutions) -> Result<(), ControllerError> {
        if in_frame_callback() {
            return Err(ControllerError::PreviewActive);
        }
        let _ops = lock(&self.preview_ops);
        if self.is_previewing() {
            return Err(ControllerError::PreviewActive);
        }
        let resolutions = self.shared.variant.resolutions(resolutions);
        let layout = {
            let mut pipeline = lock(&self.shared.pipeline);
            *pipeline = Pipeline::new(resolutions, self.shared.multiple);
            pipeline.layout
        };
        *lock(&self.shared.layout) = layout;
        lock(&self.shared.gain).reconfigure(resolutions.sensor);
        tracing::info!(frame_len = layout.frame_len(), "pipeline reconfigured");
        Ok(())
    }

    /// Start streaming every endpoint of the variant. All of them must be open.
    ///
    /// Start and stop are serialized: a `stop_preview` racing this call waits
    /// for the start to finish and then tears it down.
    pub fn start_preview(&self) -> Result<(), ControllerError> {
        let ops = self.preview_guard().ok_or(ControllerError::Busy)?;
        for id in self.shared.variant.devices() {
            let state = self.manager.state(id);
            if !state.is_open() {
                return Err(ControllerError::NotConnected { id, state });
            }
        }
        if self.previewing.load(Ordering::Acquire) {
            tracing::debug!("preview already running");
            return Ok(());
        }
        self.stop_pending.store(false, Ordering::Release);
        self.shared.first_frame.store(true, Ordering::Release);
        self.shared.fps_reset.store(true, Ordering::Release);
        if let CameraVariant::ManualAligned { offset, .. } = self.shared.variant {
            self.shared.send(IrCommand::SetAlignment {
                dx: offset.dx,
                dy: offset.dy,
            });
        }
        self.shared.delivering.store(true, Ordering::Release);
        self.previewing.store(true, Ordering::Release);
        if let Err(e) = self.start_sessions() {
            if let Err(cleanup) = self.halt() {
                tracing::warn!(error = %cleanup, "cleanup after failed preview start");
            }
            return Err(e.into());
        }
        tracing::info!(variant = self.shared.variant.name(), "preview started");
        drop(ops);

        // A listener stopped preview while the sessions were coming up.
        if self.stop_pending.load(Ordering::Acquire) {
            self.stop_preview()?;
        }
        Ok(())
    }

    /// Stop streaming. Returns only once no frame callback is running or
    /// will run; safe from any thread, including a frame listener.
    ///
    /// From a listener, while another thread is mid start or stop, frames
    /// are cut off at once and that thread completes the stop.
    pub fn stop_preview(&self) -> Result<(), ControllerError> {
        let Some(_ops) = self.preview_guard() else {
            self.shared.delivering.store(false, Ordering::Release);
            self.stop_pending.store(true, Ordering::Release);
            tracing::debug!("stop requested from a frame listener; deferred");
            return Ok(());
        };
        self.stop_pending.store(false, Ordering::Release);
        if !self.previewing.load(Ordering::Acquire) {
            return Ok(());
        }
        self.halt()?;
        tracing::info!(
            variant = self.shared.variant.name(),
            frames = self.frames_processed(),
            "preview stopped"
        );
        Ok(())
    }

    /// The preview lock. A frame callback only tries it: the holder may be
    /// waiting for that callback to drain.
    fn preview_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if !in_frame_callback() {
            return Some(lock(&self.preview_ops));
        }
        match self.preview_ops.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Cut frame delivery and stop every session. Preview lock held.
    fn halt(&self) -> Result<(), LifecycleError> {
        self.shared.delivering.store(false, Ordering::Release);
        self.previewing.store(false, Ordering::Release);
        self.stop_sessions()
    }

    fn start_sessions(&self) -> Result<(), LifecycleError> {
        for (id, channel) in self.shared.variant.companions() {
            let shared = Arc::clone(&self.shared);
            self.manager.start_preview(
                id,
                channel,
                Arc::new(move |_frame: &[u8]| {
                    if shared.delivering.load(Ordering::Acquire) {
                        shared.companion_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            )?;
        }
        let (id, channel) = self.shared.variant.source();
        let shared = Arc::clone(&self.shared);
        self.manager.start_preview(
            id,
            channel,
            Arc::new(move |frame: &[u8]| {
                if shared.delivering.load(Ordering::Acquire) {
                    shared.process(frame);
                }
            }),
        )
    }

    fn stop_sessions(&self) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        for id in self.shared.variant.devices() {
            match self.manager.stop_preview(id) {
                Ok(()) => {}
                // Detached: its sessions were already drained and retired.
                Err(LifecycleError::NotAttached(_)) => {}
                Err(e) => {
                    tracing::warn!(device = %id, error = %e, "stop preview failed");
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for DualCameraController {
    fn drop(&mut self) {
        if let Err(e) = self.stop_preview() {
            tracing::warn!(error = %e, "stop preview on drop failed");
        }
    }
}
