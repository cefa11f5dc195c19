//! # Calibration Engine
//!
//! Two-phase state machine run against the live sensor stream while the
//! device sits still in its mount:
//!
//! ```text
//! Idle -> OrientationDetecting -> OffsetCalibrating -> Complete
//!                                                   -> MovementAborted
//!                                                   -> Failed
//! ```
//!
//! 1. **OrientationDetecting**: average the accelerometer over a short window
//!    and classify which axis gravity falls on.
//! 2. **OffsetCalibrating**: collect a fixed window of still samples. Sample to
//!    sample jumps above the movement thresholds push a counter up, calm
//!    samples let it decay. When the counter reaches the abort count the
//!    window is thrown away.
//!
//! The engine is driven purely by sample timestamps so it can be tested with
//! replayed data. `run_calibration` wraps it with a wall-clock safety timeout.

use crate::broadcast::Broadcaster;
use crate::config::CalibrationConfig;
use crate::error::SessionError;
use crate::profile::{CalibrationProfile, Orientation, SessionCalibration, GRAVITY};
use crate::sample::RawSample;
use crate::sensor::SensorHub;
use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use std::fmt;
use std::time::{Duration, Instant};

/// Averaged magnitude further than this from 1 g means the reading is not a
/// clean gravity vector
const MAGNITUDE_TOLERANCE: f64 = 2.5;
const STRICT_AXIS_THRESHOLD: f64 = 0.65;
const LOOSE_AXIS_THRESHOLD: f64 = 0.5;

const LOG_TARGET: &str = "roadscan::calibration";

/// How long the driver waits on the stream before checking timeouts
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    OrientationDetecting,
    OffsetCalibrating,
    Complete,
    MovementAborted,
    Failed,
}

impl CalibrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CalibrationState::Complete | CalibrationState::MovementAborted | CalibrationState::Failed
        )
    }
}

/// Classify the mount from an averaged accelerometer vector
pub fn classify_orientation(mean_accel: [f64; 3]) -> Orientation {
    let [x, y, z] = mean_accel;
    let magnitude = (x * x + y * y + z * z).sqrt();
    if (magnitude - GRAVITY).abs() > MAGNITUDE_TOLERANCE {
        return Orientation::Unknown;
    }

    let normalized = [x / magnitude, y / magnitude, z / magnitude];
    // One axis above the threshold, every other axis clearly below it
    let single_axis = |threshold: f64| {
        let axis = normalized.iter().position(|v| v.abs() > threshold)?;
        (0..3)
            .all(|i| i == axis || normalized[i].abs() < 1.0 - threshold)
            .then_some(axis)
    };

    let axis = single_axis(STRICT_AXIS_THRESHOLD)
        .or_else(|| single_axis(LOOSE_AXIS_THRESHOLD))
        .or_else(|| majority_axis(mean_accel));

    match axis {
        Some(0) if x > 0.0 => Orientation::LandscapeRight,
        Some(0) => Orientation::LandscapeLeft,
        Some(1) => Orientation::Portrait,
        Some(_) => Orientation::Flat,
        None => Orientation::Unknown,
    }
}

/// Axis holding more than half of the summed absolute components
fn majority_axis(accel: [f64; 3]) -> Option<usize> {
    let abs = accel.map(f64::abs);
    let total: f64 = abs.iter().sum();
    (0..3).find(|&i| abs[i] > total - abs[i])
}

/// Timing and thresholds for one calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationWindow {
    pub orientation_ms: i64,
    pub offset_ms: i64,
    pub expected_samples: usize,
    pub min_sample_ratio: f64,
    pub safety_timeout: Duration,
    pub accel_movement_threshold: f64,
    pub gyro_movement_threshold: f64,
    pub movement_abort_count: u32,
}

impl CalibrationWindow {
    /// Full calibration that produces the stored profile
    pub fn initial(config: &CalibrationConfig) -> Self {
        Self::with_offset_window(config, config.offset_window_ms)
    }

    /// Short calibration run right before a recording
    pub fn session(config: &CalibrationConfig) -> Self {
        Self::with_offset_window(config, config.session_offset_window_ms)
    }

    fn with_offset_window(config: &CalibrationConfig, offset_ms: i64) -> Self {
        let expected = offset_ms.max(0) as u64 * config.sample_rate_hz as u64 / 1_000;
        Self {
            orientation_ms: config.orientation_window_ms,
            offset_ms,
            expected_samples: expected as usize,
            min_sample_ratio: config.min_sample_ratio,
            safety_timeout: Duration::from_millis(config.safety_timeout_ms),
            accel_movement_threshold: config.accel_movement_threshold,
            gyro_movement_threshold: config.gyro_movement_threshold,
            movement_abort_count: config.movement_abort_count,
        }
    }

    /// Smallest sample count that still counts as a complete window
    pub fn required_samples(&self) -> usize {
        // Nudge down so 1500 * 0.7 lands on 1050, not 1051
        (self.expected_samples as f64 * self.min_sample_ratio - 1e-9).ceil() as usize
    }
}

/// Statistics of the accepted offset window
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSummary {
    pub orientation: Orientation,
    pub accel_mean: [f64; 3],
    pub gyro_mean: [f64; 3],
    pub magnitude_mean: f64,
    pub magnitude_std: f64,
    pub sample_count: usize,
    /// Forced by the safety timeout before the window closed
    pub partial: bool,
}

impl CalibrationSummary {
    fn from_samples(orientation: Orientation, samples: &[RawSample], partial: bool) -> Self {
        let n = samples.len().max(1) as f64;
        let mut accel_mean = [0.0; 3];
        let mut gyro_mean = [0.0; 3];
        let mut magnitude_mean = 0.0;

        for sample in samples {
            for i in 0..3 {
                accel_mean[i] += sample.accel()[i] / n;
                gyro_mean[i] += sample.gyro()[i] / n;
            }
            magnitude_mean += sample.accel_magnitude() / n;
        }

        let variance = samples
            .iter()
            .map(|s| (s.accel_magnitude() - magnitude_mean).powi(2))
            .sum::<f64>()
            / n;

        Self {
            orientation,
            accel_mean,
            gyro_mean,
            magnitude_mean,
            magnitude_std: variance.sqrt(),
            sample_count: samples.len(),
            partial,
        }
    }
}

impl CalibrationProfile {
    /// Offsets are the window means minus the gravity expected for the mount
    pub fn from_summary(summary: &CalibrationSummary, created_at: DateTime<Utc>) -> Self {
        let gravity = summary.orientation.gravity_for(summary.accel_mean);
        Self {
            orientation: summary.orientation,
            accel_offset_x: summary.accel_mean[0] - gravity[0],
            accel_offset_y: summary.accel_mean[1] - gravity[1],
            accel_offset_z: summary.accel_mean[2] - gravity[2],
            gyro_offset_x: summary.gyro_mean[0],
            gyro_offset_y: summary.gyro_mean[1],
            gyro_offset_z: summary.gyro_mean[2],
            created_at,
        }
    }
}

impl SessionCalibration {
    /// Residual drift left after `profile` is applied, plus a detection
    /// threshold derived from the resting magnitude spread
    pub fn from_summary(
        summary: &CalibrationSummary,
        profile: &CalibrationProfile,
        config: &CalibrationConfig,
    ) -> Self {
        let expected_z = profile.orientation.gravity_for(summary.accel_mean)[2];
        let session_accel_offset_z = summary.accel_mean[2] - profile.accel_offset_z - expected_z;
        let gyro_z_drift = summary.gyro_mean[2] - profile.gyro_offset_z;

        let [x, y, z] = summary.accel_mean;
        let corrected_z = z - profile.accel_offset_z - session_accel_offset_z;
        let resting_magnitude = (x * x + y * y + corrected_z * corrected_z).sqrt();
        let spread = (config.event_threshold_sigma * summary.magnitude_std)
            .max(config.event_threshold_margin);

        Self {
            session_accel_offset_z,
            gyro_z_drift,
            event_threshold: resting_magnitude + spread,
        }
    }
}

/// Result of a finished calibration run
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Complete(CalibrationSummary),
    /// Device moved during the offset window; nothing was kept
    MovementAborted,
    /// Too few samples arrived before the window closed
    Failed { collected: usize, required: usize },
}

impl CalibrationOutcome {
    pub fn state(&self) -> CalibrationState {
        match self {
            CalibrationOutcome::Complete(_) => CalibrationState::Complete,
            CalibrationOutcome::MovementAborted => CalibrationState::MovementAborted,
            CalibrationOutcome::Failed { .. } => CalibrationState::Failed,
        }
    }
}

impl fmt::Display for CalibrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationOutcome::Complete(summary) => write!(
                f,
                "Calibration complete ({}, {} samples{})",
                summary.orientation.name(),
                summary.sample_count,
                if summary.partial { ", partial" } else { "" }
            ),
            CalibrationOutcome::MovementAborted => write!(
                f,
                "Calibration aborted: movement detected. Keep the device still and try again"
            ),
            CalibrationOutcome::Failed {
                collected,
                required,
            } => write!(
                f,
                "Calibration failed: only {} of {} required samples received",
                collected, required
            ),
        }
    }
}

/// Timestamp-driven calibration state machine
#[derive(Debug)]
pub struct CalibrationEngine {
    window: CalibrationWindow,
    state: CalibrationState,
    phase_start: Option<i64>,
    orientation_samples: Vec<RawSample>,
    orientation: Orientation,
    samples: Vec<RawSample>,
    previous: Option<RawSample>,
    movement_counter: u32,
    outcome: Option<CalibrationOutcome>,
}

impl CalibrationEngine {
    pub fn new(window: CalibrationWindow) -> Self {
        Self {
            window,
            state: CalibrationState::Idle,
            phase_start: None,
            orientation_samples: Vec::new(),
            orientation: Orientation::Unknown,
            samples: Vec::new(),
            previous: None,
            movement_counter: 0,
            outcome: None,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn window(&self) -> &CalibrationWindow {
        &self.window
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Begin a new run, discarding anything from a previous one
    pub fn start(&mut self) {
        self.phase_start = None;
        self.orientation_samples.clear();
        self.orientation = Orientation::Unknown;
        self.samples.clear();
        self.previous = None;
        self.movement_counter = 0;
        self.outcome = None;
        self.transition(CalibrationState::OrientationDetecting);
    }

    pub fn push(&mut self, sample: RawSample) -> CalibrationState {
        let ts = sample.device_timestamp_ms;
        match self.state {
            CalibrationState::OrientationDetecting => {
                let start = *self.phase_start.get_or_insert(ts);
                if ts - start >= self.window.orientation_ms {
                    self.finish_orientation(Some(ts));
                    self.push_offset_sample(sample);
                } else {
                    self.orientation_samples.push(sample);
                }
            }
            CalibrationState::OffsetCalibrating => {
                let start = *self.phase_start.get_or_insert(ts);
                if ts - start >= self.window.offset_ms {
                    self.finish_window(false);
                } else {
                    self.push_offset_sample(sample);
                }
            }
            _ => {}
        }
        self.state
    }

    /// Close any window that ends at or before `device_ms`, even if no sample
    /// arrived to do it
    pub fn advance_to(&mut self, device_ms: i64) -> CalibrationState {
        if self.state == CalibrationState::OrientationDetecting {
            if let Some(start) = self.phase_start {
                if device_ms - start >= self.window.orientation_ms {
                    self.finish_orientation(Some(device_ms));
                }
            }
        }
        if self.state == CalibrationState::OffsetCalibrating {
            if let Some(start) = self.phase_start {
                if device_ms - start >= self.window.offset_ms {
                    self.finish_window(false);
                }
            }
        }
        self.state
    }

    /// The stream ended: judge the window with what was collected
    pub fn end_of_stream(&mut self) -> CalibrationState {
        if self.state == CalibrationState::OrientationDetecting {
            self.finish_orientation(None);
        }
        if self.state == CalibrationState::OffsetCalibrating {
            self.finish_window(false);
        }
        self.state
    }

    /// Safety timeout: complete with whatever data exists
    pub fn force_complete(&mut self) -> CalibrationState {
        if self.is_finished() || self.state == CalibrationState::Idle {
            return self.state;
        }
        if self.state == CalibrationState::OrientationDetecting {
            self.finish_orientation(None);
        }

        let partial = if self.samples.is_empty() {
            &self.orientation_samples
        } else {
            &self.samples
        };

        if partial.is_empty() {
            self.outcome = Some(CalibrationOutcome::Failed {
                collected: 0,
                required: self.window.required_samples(),
            });
            self.transition(CalibrationState::Failed);
        } else {
            log::warn!(
                target: LOG_TARGET,
                "Safety timeout reached, completing with {} samples",
                partial.len()
            );
            let summary = CalibrationSummary::from_samples(self.orientation, partial, true);
            self.outcome = Some(CalibrationOutcome::Complete(summary));
            self.transition(CalibrationState::Complete);
        }
        self.state
    }

    pub fn outcome(&self) -> Option<&CalibrationOutcome> {
        self.outcome.as_ref()
    }

    /// Hand out the result and return to `Idle`
    pub fn take_outcome(&mut self) -> Option<CalibrationOutcome> {
        let outcome = self.outcome.take();
        if outcome.is_some() {
            self.state = CalibrationState::Idle;
        }
        outcome
    }

    fn finish_orientation(&mut self, offset_start: Option<i64>) {
        let n = self.orientation_samples.len();
        self.orientation = if n == 0 {
            Orientation::Unknown
        } else {
            let mut mean = [0.0; 3];
            for sample in &self.orientation_samples {
                for (m, v) in mean.iter_mut().zip(sample.accel()) {
                    *m += v / n as f64;
                }
            }
            classify_orientation(mean)
        };

        log::info!(
            target: LOG_TARGET,
            "Orientation detected: {} ({} samples)",
            self.orientation.name(),
            n
        );
        self.phase_start = offset_start;
        self.previous = None;
        self.transition(CalibrationState::OffsetCalibrating);
    }

    fn push_offset_sample(&mut self, sample: RawSample) {
        if let Some(previous) = self.previous {
            if self.is_movement(&previous, &sample) {
                self.movement_counter += 1;
            } else {
                self.movement_counter = self.movement_counter.saturating_sub(1);
            }
        }
        self.previous = Some(sample);

        if self.movement_counter >= self.window.movement_abort_count {
            log::warn!(
                target: LOG_TARGET,
                "Movement detected, discarding {} samples",
                self.samples.len()
            );
            self.samples.clear();
            self.orientation_samples.clear();
            self.outcome = Some(CalibrationOutcome::MovementAborted);
            self.transition(CalibrationState::MovementAborted);
            return;
        }

        self.samples.push(sample);
    }

    fn is_movement(&self, previous: &RawSample, current: &RawSample) -> bool {
        let prev = previous.channels();
        let curr = current.channels();
        (0..6).any(|i| {
            let threshold = if i < 3 {
                self.window.accel_movement_threshold
            } else {
                self.window.gyro_movement_threshold
            };
            (curr[i] - prev[i]).abs() > threshold
        })
    }

    fn finish_window(&mut self, partial: bool) {
        let required = self.window.required_samples();
        if self.samples.len() >= required && !self.samples.is_empty() {
            let summary = CalibrationSummary::from_samples(self.orientation, &self.samples, partial);
            self.outcome = Some(CalibrationOutcome::Complete(summary));
            self.transition(CalibrationState::Complete);
        } else {
            log::warn!(
                target: LOG_TARGET,
                "Insufficient samples: {} of {} required",
                self.samples.len(),
                required
            );
            self.outcome = Some(CalibrationOutcome::Failed {
                collected: self.samples.len(),
                required,
            });
            self.transition(CalibrationState::Failed);
        }
    }

    fn transition(&mut self, next: CalibrationState) {
        if self.state != next {
            log::info!(
                target: LOG_TARGET,
                "Calibration {:?} -> {:?}",
                self.state,
                next
            );
            self.state = next;
        }
    }
}

/// Run one calibration against the sensor, blocking until it finishes.
///
/// Holds the sensor lease for the whole run, so a recording cannot start
/// meanwhile (and vice versa). Progress states are published on `progress`.
pub fn run_calibration(
    hub: &SensorHub,
    window: CalibrationWindow,
    progress: Option<&Broadcaster<CalibrationState>>,
) -> Result<CalibrationOutcome, SessionError> {
    let subscription = hub.subscribe()?;
    let safety_timeout = window.safety_timeout;
    let mut engine = CalibrationEngine::new(window);

    let publish = |state: CalibrationState| {
        if let Some(feed) = progress {
            feed.publish(state);
        }
    };

    engine.start();
    publish(engine.state());

    let started = Instant::now();
    let mut last_sample: Option<(i64, Instant)> = None;

    while !engine.is_finished() {
        let remaining = safety_timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            engine.force_complete();
            break;
        }

        let before = engine.state();
        match subscription.receiver().recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(Ok(sample)) => {
                last_sample = Some((sample.device_timestamp_ms, Instant::now()));
                engine.push(sample);
            }
            Ok(Err(e)) => {
                log::warn!(target: LOG_TARGET, "{}", e);
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some((ts, at)) = last_sample {
                    engine.advance_to(ts + at.elapsed().as_millis() as i64);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                engine.end_of_stream();
            }
        }

        if engine.state() != before && !engine.is_finished() {
            publish(engine.state());
        }
    }

    subscription.unsubscribe();
    publish(engine.state());

    let outcome = engine.take_outcome().unwrap_or(CalibrationOutcome::Failed {
        collected: 0,
        required: engine.window().required_samples(),
    });
    log::info!(target: LOG_TARGET, "{}", outcome);
    Ok(outcome)
}
