//! # Signal Conditioning
//!
//! Per-axis exponential smoothing followed by calibration-offset correction.
//! Runs on the ingestion thread once per sample, so everything here is pure
//! arithmetic with no allocation beyond the output sample.

use crate::error::ConfigError;
use crate::profile::{CalibrationProfile, SessionCalibration};
use crate::sample::{CorrectedSample, RawSample};

/// Exponential moving average for a single axis
#[derive(Debug, Clone)]
pub struct EmaFilter {
    alpha: f64,
    previous: Option<f64>,
}

impl EmaFilter {
    /// `alpha` weights the newest value and must lie in (0, 1]
    pub fn new(alpha: f64) -> Result<Self, ConfigError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "signal.ema_alpha",
                reason: format!("{} is not in (0, 1]", alpha),
            });
        }
        Ok(Self {
            alpha,
            previous: None,
        })
    }

    pub fn filter(&mut self, value: f64) -> f64 {
        let smoothed = match self.previous {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.previous = Some(smoothed);
        smoothed
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Apply the stored profile and the session adjustment to a smoothed sample
pub fn correct(
    sample: &RawSample,
    relative_timestamp_ms: i64,
    profile: &CalibrationProfile,
    session: &SessionCalibration,
) -> CorrectedSample {
    let (accel_x, accel_y, gyro_x, gyro_y) = if profile.orientation.swaps_xy() {
        (sample.accel_y, sample.accel_x, sample.gyro_y, sample.gyro_x)
    } else {
        (sample.accel_x, sample.accel_y, sample.gyro_x, sample.gyro_y)
    };

    // Offsets are subtracted the same way for every orientation.
    let accel_z = sample.accel_z - profile.accel_offset_z - session.session_accel_offset_z;
    let gyro_z = sample.gyro_z - profile.gyro_offset_z - session.gyro_z_drift;

    CorrectedSample {
        relative_timestamp_ms,
        accel_x,
        accel_y,
        accel_z,
        accel_magnitude: (accel_x * accel_x + accel_y * accel_y + accel_z * accel_z).sqrt(),
        gyro_x,
        gyro_y,
        gyro_z,
        is_event: false,
        user_feedback: String::new(),
    }
}

/// Smoothing state for all six channels
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    filters: [EmaFilter; 6],
}

impl SignalConditioner {
    pub fn new(alpha: f64) -> Result<Self, ConfigError> {
        let filter = EmaFilter::new(alpha)?;
        Ok(Self {
            filters: std::array::from_fn(|_| filter.clone()),
        })
    }

    pub fn condition(
        &mut self,
        raw: &RawSample,
        relative_timestamp_ms: i64,
        profile: &CalibrationProfile,
        session: &SessionCalibration,
    ) -> CorrectedSample {
        let channels = raw.channels();
        let mut smoothed = [0.0; 6];
        for ((out, filter), value) in smoothed.iter_mut().zip(self.filters.iter_mut()).zip(channels) {
            *out = filter.filter(value);
        }

        let smoothed = RawSample::new(
            [smoothed[0], smoothed[1], smoothed[2]],
            [smoothed[3], smoothed[4], smoothed[5]],
            raw.device_timestamp_ms,
        );
        correct(&smoothed, relative_timestamp_ms, profile, session)
    }

    /// Forget filter memory; call at session boundaries
    pub fn reset(&mut self) {
        for filter in self.filters.iter_mut() {
            filter.reset();
        }
    }
}
