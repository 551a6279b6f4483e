//! Auto gain switching and overexposure protection.
//!
//! Both loops are driven by the raw temperature plane of the current frame,
//! one evaluation per frame, in capture order. Temperatures are compared in
//! sensor ticks: the Y16 temperature plane stores 1/64 Kelvin per tick.

use crate::layout::Resolution;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Temperature plane resolution: ticks per Kelvin.
pub const TICKS_PER_KELVIN: f32 = 64.0;

const KELVIN_OFFSET: f32 = 273.15;

/// Convert degrees Celsius to temperature-plane ticks, saturating at the u16 range.
pub fn celsius_to_ticks(celsius: f32) -> u16 {
    ((celsius + KELVIN_OFFSET) * TICKS_PER_KELVIN)
        .round()
        .clamp(0.0, u16::MAX as f32) as u16
}

pub fn ticks_to_celsius(ticks: u16) -> f32 {
    ticks as f32 / TICKS_PER_KELVIN - KELVIN_OFFSET
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GainError {
    #[error("invalid temperature plane: expected {expected} bytes, got {actual}")]
    InvalidInput { expected: usize, actual: usize },
}

/// Sensor gain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GainStatus {
    /// Narrow range, fine resolution.
    #[default]
    High,
    /// Wide range for hot scenes.
    Low,
}

impl GainStatus {
    pub fn flipped(self) -> Self {
        match self {
            GainStatus::High => GainStatus::Low,
            GainStatus::Low => GainStatus::High,
        }
    }
}

impl fmt::Display for GainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GainStatus::High => "high",
            GainStatus::Low => "low",
        })
    }
}

impl FromStr for GainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(GainStatus::High),
            "low" => Ok(GainStatus::Low),
            other => Err(format!("unknown gain status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchState {
    Idle,
    /// A switch was decided this frame and awaits hand-off to the hardware.
    Switching,
    /// Frames after a switch during which no switch is evaluated.
    Cooldown,
}

/// Primary gain loop state. Persists across frames until reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainState {
    pub gain_status: GainStatus,
    pub switch_state: SwitchState,
    pub consecutive_above: u32,
    pub consecutive_below: u32,
    pub cooldown_remaining: u32,
}

impl GainState {
    fn new(gain_status: GainStatus) -> Self {
        Self {
            gain_status,
            switch_state: SwitchState::Idle,
            consecutive_above: 0,
            consecutive_below: 0,
            cooldown_remaining: 0,
        }
    }
}

/// Thresholds for the primary gain loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainParams {
    /// Fraction of samples above `above_threshold` that counts a frame as hot.
    pub above_fraction: f32,
    pub above_threshold: u16,
    /// Fraction of samples below `below_threshold` that counts a frame as cold.
    pub below_fraction: f32,
    pub below_threshold: u16,
    /// Consecutive qualifying frames required before switching.
    pub switch_frame_count: u32,
    /// Frames after a switch during which no switch is evaluated.
    pub waiting_frame_count: u32,
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            above_fraction: 0.1,
            above_threshold: celsius_to_ticks(130.0),
            below_fraction: 0.95,
            below_threshold: celsius_to_ticks(110.0),
            switch_frame_count: 5 * 15,
            waiting_frame_count: 7 * 15,
        }
    }
}

/// Thresholds for overexposure protection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverexposureParams {
    /// Fraction of saturating samples that counts a frame as overexposed.
    pub pixel_above_proportion: f32,
    /// Saturation threshold while the sensor runs in low gain.
    pub low_gain_threshold: u16,
    /// Saturation threshold while the sensor runs in high gain.
    pub high_gain_threshold: u16,
    /// Consecutive overexposed frames before protection engages.
    pub switch_frame_count: u32,
    /// Consecutive clear frames before protection releases.
    pub close_frame_count: u32,
}

impl Default for OverexposureParams {
    fn default() -> Self {
        Self {
            pixel_above_proportion: 0.02,
            low_gain_threshold: celsius_to_ticks(550.0),
            high_gain_threshold: celsius_to_ticks(100.0),
            switch_frame_count: 7 * 15,
            close_frame_count: 10 * 15,
        }
    }
}

impl OverexposureParams {
    fn threshold_for(&self, gain: GainStatus) -> u16 {
        match gain {
            GainStatus::High => self.high_gain_threshold,
            GainStatus::Low => self.low_gain_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverexposureTransition {
    Engaged,
    Released,
}

/// What one frame's evaluation asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GainOutcome {
    /// Primary loop switched to this status; write it, then call
    /// [`GainController::complete_switch`].
    pub switched: Option<GainStatus>,
    /// Overexposure protection changed state.
    pub overexposure: Option<OverexposureTransition>,
    /// Gain register value forced (on engage) or restored (on release) by protection.
    pub gain_override: Option<GainStatus>,
}

impl GainOutcome {
    pub fn is_empty(&self) -> bool {
        self.switched.is_none() && self.overexposure.is_none() && self.gain_override.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Protection {
    engaged: bool,
    overridden: bool,
    over_count: u32,
    clear_count: u32,
}

/// Closed-loop gain controller with hysteresis plus an independent
/// overexposure guard.
///
/// While protection is engaged the primary loop is suspended; protection
/// can engage during the primary loop's cooldown.
#[derive(Debug, Clone)]
pub struct GainController {
    params: GainParams,
    protection_params: OverexposureParams,
    sensor: Resolution,
    state: GainState,
    protection: Protection,
    auto_gain: bool,
    overexposure_guard: bool,
}

impl GainController {
    /// Frame counts of zero are raised to one: a switch always needs at
    /// least one qualifying frame.
    pub fn new(mut params: GainParams, mut protection_params: OverexposureParams, sensor: Resolution) -> Self {
        params.switch_frame_count = params.switch_frame_count.max(1);
        protection_params.switch_frame_count = protection_params.switch_frame_count.max(1);
        protection_params.close_frame_count = protection_params.close_frame_count.max(1);
        Self {
            params,
            protection_params,
            sensor,
            state: GainState::new(GainStatus::High),
            protection: Protection::default(),
            auto_gain: true,
            overexposure_guard: true,
        }
    }

    pub fn state(&self) -> GainState {
        self.state
    }

    pub fn params(&self) -> &GainParams {
        &self.params
    }

    pub fn protection_engaged(&self) -> bool {
        self.protection.engaged
    }

    /// Gain the sensor is actually running at, including a protection override.
    pub fn effective_gain(&self) -> GainStatus {
        if self.protection.overridden {
            GainStatus::Low
        } else {
            self.state.gain_status
        }
    }

    pub fn set_auto_gain(&mut self, enabled: bool) {
        if self.auto_gain != enabled {
            self.auto_gain = enabled;
            self.reset_counters();
        }
    }

    pub fn set_overexposure_guard(&mut self, enabled: bool) {
        self.overexposure_guard = enabled;
        if !enabled {
            self.protection = Protection::default();
        }
    }

    /// Manual gain override; restarts hysteresis from scratch.
    ///
    /// Returns the register value to write now. While protection is engaged
    /// the sensor stays at low gain and `status` is restored on release.
    pub fn set_gain_status(&mut self, status: GainStatus) -> Option<GainStatus> {
        self.state = GainState::new(status);
        if self.protection.engaged {
            self.protection.overridden = status == GainStatus::High;
            return None;
        }
        Some(status)
    }

    /// Adopt a new sensor resolution. Hysteresis state is kept.
    pub fn reconfigure(&mut self, sensor: Resolution) {
        self.sensor = sensor;
    }

    /// Drop all hysteresis and protection state, keeping the current gain.
    pub fn reset(&mut self) {
        self.state = GainState::new(self.state.gain_status);
        self.protection = Protection::default();
    }

    /// Report whether the switch decided by the last evaluation reached the
    /// hardware. On failure the switch is reverted.
    pub fn complete_switch(&mut self, applied: bool) {
        if self.state.switch_state != SwitchState::Switching {
            return;
        }
        if applied {
            self.enter_cooldown();
        } else {
            tracing::warn!(gain = %self.state.gain_status, "gain switch not applied; reverting");
            self.state.gain_status = self.state.gain_status.flipped();
            self.state.switch_state = SwitchState::Idle;
        }
    }

    /// Evaluate one frame's raw temperature plane (little-endian u16 ticks).
    ///
    /// Rejects a plane of the wrong size without touching any state.
    pub fn evaluate(&mut self, temperature: &[u8]) -> Result<GainOutcome, GainError> {
        let expected = self.sensor.pixels() * 2;
        if expected == 0 || temperature.len() != expected {
            return Err(GainError::InvalidInput {
                expected,
                actual: temperature.len(),
            });
        }

        let over_threshold = self.protection_params.threshold_for(self.effective_gain());
        let stats = TemperatureStats::scan(
            temperature,
            self.params.above_threshold,
            self.params.below_threshold,
            over_threshold,
        );

        let mut outcome = GainOutcome::default();
        if self.overexposure_guard {
            self.step_protection(stats.fraction(stats.over), &mut outcome);
        }
        if self.auto_gain && !self.protection.engaged {
            outcome.switched = self.step_primary(&stats);
        }
        Ok(outcome)
    }

    fn step_primary(&mut self, stats: &TemperatureStats) -> Option<GainStatus> {
        match self.state.switch_state {
            SwitchState::Switching => {
                // Unacknowledged switch counts as applied; this frame is the first cooldown frame.
                self.enter_cooldown();
                self.tick_cooldown();
                return None;
            }
            SwitchState::Cooldown => {
                self.tick_cooldown();
                return None;
            }
            SwitchState::Idle => {}
        }

        let p = &self.params;
        let state = &mut self.state;
        if stats.fraction(stats.above) > p.above_fraction {
            state.consecutive_above += 1;
        } else {
            state.consecutive_above = 0;
        }
        if stats.fraction(stats.below) > p.below_fraction {
            state.consecutive_below += 1;
        } else {
            state.consecutive_below = 0;
        }

        let target = match state.gain_status {
            GainStatus::High if state.consecutive_above >= p.switch_frame_count => GainStatus::Low,
            GainStatus::Low if state.consecutive_below >= p.switch_frame_count => GainStatus::High,
            _ => return None,
        };

        tracing::info!(from = %state.gain_status, to = %target, "auto gain switch");
        state.gain_status = target;
        state.switch_state = SwitchState::Switching;
        state.consecutive_above = 0;
        state.consecutive_below = 0;
        Some(target)
    }

    fn step_protection(&mut self, over_fraction: f32, outcome: &mut GainOutcome) {
        let params = self.protection_params;
        let guard = &mut self.protection;
        let overexposed = over_fraction > params.pixel_above_proportion;

        if !guard.engaged {
            guard.over_count = if overexposed { guard.over_count + 1 } else { 0 };
            if guard.over_count >= params.switch_frame_count {
                guard.engaged = true;
                guard.over_count = 0;
                guard.clear_count = 0;
                guard.overridden = self.state.gain_status == GainStatus::High;
                outcome.overexposure = Some(OverexposureTransition::Engaged);
                if guard.overridden {
                    outcome.gain_override = Some(GainStatus::Low);
                }
                tracing::warn!(fraction = over_fraction, "overexposure protection engaged");
            }
        } else {
            guard.clear_count = if overexposed { 0 } else { guard.clear_count + 1 };
            if guard.clear_count >= params.close_frame_count {
                if guard.overridden {
                    outcome.gain_override = Some(self.state.gain_status);
                }
                *guard = Protection::default();
                outcome.overexposure = Some(OverexposureTransition::Released);
                tracing::info!("overexposure protection released");
                self.reset_counters();
            }
        }
    }

    fn enter_cooldown(&mut self) {
        self.state.cooldown_remaining = self.params.waiting_frame_count;
        self.state.switch_state = if self.state.cooldown_remaining == 0 {
            SwitchState::Idle
        } else {
            SwitchState::Cooldown
        };
    }

    fn tick_cooldown(&mut self) {
        self.state.cooldown_remaining = self.state.cooldown_remaining.saturating_sub(1);
        if self.state.cooldown_remaining == 0 {
            self.state.switch_state = SwitchState::Idle;
        }
    }

    fn reset_counters(&mut self) {
        self.state.consecutive_above = 0;
        self.state.consecutive_below = 0;
    }
}

/// Sample counts for one temperature plane, gathered in a single pass.
#[derive(Debug, Clone, Copy)]
struct TemperatureStats {
    samples: usize,
    above: usize,
    below: usize,
    over: usize,
}

impl TemperatureStats {
    fn scan(plane: &[u8], above_threshold: u16, below_threshold: u16, over_threshold: u16) -> Self {
        let mut stats = Self {
            samples: plane.len() / 2,
            above: 0,
            below: 0,
            over: 0,
        };
        for sample in plane.chunks_exact(2) {
            let t = u16::from_le_bytes([sample[0], sample[1]]);
            stats.above += usize::from(t > above_threshold);
            stats.below += usize::from(t < below_threshold);
            stats.over += usize::from(t > over_threshold);
        }
        stats
    }

    fn fraction(&self, count: usize) -> f32 {
        if self.samples == 0 {
            0.0
        } else {
            count as f32 / self.samples as f32
        }
    }
}
