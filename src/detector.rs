//! Threshold detector with a refractory window.
//! A single bump rings for a few hundred milliseconds; every sample after the
//! first one inside the window is ignored so the burst counts as one event.

use crate::sample::CorrectedSample;

pub const DEFAULT_REFRACTORY_MS: i64 = 8_000;

#[derive(Debug, Clone)]
pub struct SpikeDetector {
    threshold: f64,
    refractory_period_ms: i64,
    last_event_timestamp: Option<i64>,
}

impl SpikeDetector {
    pub fn new(threshold: f64, refractory_period_ms: i64) -> Self {
        Self {
            threshold,
            refractory_period_ms,
            last_event_timestamp: None,
        }
    }

    /// Re-arm with a new threshold, e.g. after pre-recording calibration
    pub fn initialize(&mut self, threshold: f64, refractory_period_ms: i64) {
        self.threshold = threshold;
        self.refractory_period_ms = refractory_period_ms;
        self.last_event_timestamp = None;
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn detect(&mut self, sample: &CorrectedSample) -> bool {
        if sample.accel_magnitude <= self.threshold {
            return false;
        }

        let ts = sample.relative_timestamp_ms;
        let ready = match self.last_event_timestamp {
            None => true,
            Some(last) => ts - last >= self.refractory_period_ms,
        };

        if ready {
            self.last_event_timestamp = Some(ts);
        }
        ready
    }

    pub fn reset(&mut self) {
        self.last_event_timestamp = None;
    }
}
