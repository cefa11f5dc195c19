//! # Sensor Source Module
//!
//! The live 6-axis stream is consumed by exactly one party at a time:
//! either a calibration run or a recording session. `SensorHub` hands out a
//! single `Subscription` lease; dropping it closes the stream and frees the
//! sensor for the next consumer.
//!
//! ## Sources
//! - `SyntheticSource`: paced 100 Hz generator with optional bumps and a
//!   movement burst, used by the CLI and for soak testing
//! - `VecSource`: replays a fixed list of events, used by tests

use crate::error::{SampleStreamError, SessionError};
use crate::sample::RawSample;
use crossbeam_channel::{bounded, unbounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type SourceEvent = Result<RawSample, SampleStreamError>;

/// Anything that can deliver a live sample stream.
///
/// Dropping the returned receiver must end the stream.
pub trait SensorSource: Send + Sync {
    fn open(&self) -> Result<Receiver<SourceEvent>, SampleStreamError>;
}

/// Grants exclusive access to one sensor source
#[derive(Clone)]
pub struct SensorHub {
    source: Arc<dyn SensorSource>,
    in_use: Arc<AtomicBool>,
}

impl SensorHub {
    pub fn new(source: impl SensorSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> Result<Subscription, SessionError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::SourceBusy);
        }

        match self.source.open() {
            Ok(receiver) => {
                log::debug!("Sensor subscription opened");
                Ok(Subscription {
                    receiver,
                    lease: self.in_use.clone(),
                })
            }
            Err(e) => {
                self.in_use.store(false, Ordering::Release);
                Err(SessionError::Stream(e))
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Exclusive lease on the sensor stream
pub struct Subscription {
    receiver: Receiver<SourceEvent>,
    lease: Arc<AtomicBool>,
}

impl Subscription {
    pub fn receiver(&self) -> &Receiver<SourceEvent> {
        &self.receiver
    }

    /// Explicitly end the stream and release the sensor
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.lease.store(false, Ordering::Release);
        log::debug!("Sensor subscription released");
    }
}

/// Replays a fixed event list, then ends the stream
pub struct VecSource {
    events: Vec<SourceEvent>,
}

impl VecSource {
    pub fn new(samples: Vec<RawSample>) -> Self {
        Self {
            events: samples.into_iter().map(Ok).collect(),
        }
    }

    pub fn from_events(events: Vec<SourceEvent>) -> Self {
        Self { events }
    }
}

impl SensorSource for VecSource {
    fn open(&self) -> Result<Receiver<SourceEvent>, SampleStreamError> {
        let (tx, rx) = unbounded();
        for event in &self.events {
            // Receiver is still in scope; send cannot fail here
            let _ = tx.send(event.clone());
        }
        Ok(rx)
    }
}

/// Shape of the generated signal
#[derive(Debug, Clone)]
pub struct SyntheticProfile {
    pub rate_hz: u32,
    /// Gravity vector for the simulated mount
    pub gravity: [f64; 3],
    pub noise: f64,
    /// Emit a short high-g bump at this period
    pub bump_every_ms: Option<i64>,
    /// Shake the device for `(start_ms, duration_ms)` after opening
    pub movement: Option<(i64, i64)>,
    /// End the stream after this many samples
    pub limit: Option<usize>,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            rate_hz: 100,
            gravity: [0.0, 0.0, 9.81],
            noise: 0.02,
            bump_every_ms: None,
            movement: None,
            limit: None,
        }
    }
}

impl SyntheticProfile {
    /// Sample for `elapsed_ms` after the stream opened
    pub fn sample_at(&self, index: u64, elapsed_ms: i64, device_timestamp_ms: i64) -> RawSample {
        let t = index as f64;
        let n = self.noise;
        let mut accel = [
            self.gravity[0] + (t * 0.37).sin() * n,
            self.gravity[1] + (t * 0.53).cos() * n,
            self.gravity[2] + (t * 0.71).sin() * n,
        ];
        let mut gyro = [
            (t * 0.29).sin() * n * 0.1,
            (t * 0.41).cos() * n * 0.1,
            (t * 0.61).sin() * n * 0.1,
        ];

        if let Some(period) = self.bump_every_ms {
            let phase = elapsed_ms.rem_euclid(period.max(1));
            if elapsed_ms >= period && phase < 60 {
                // Damped ring-down after the hit
                let decay = (-(phase as f64) / 20.0).exp();
                accel[2] += 12.0 * decay * (phase as f64 * 0.9).cos();
                accel[0] += 3.0 * decay;
            }
        }

        if let Some((start, duration)) = self.movement {
            if elapsed_ms >= start && elapsed_ms < start + duration {
                let sign = if index % 2 == 0 { 1.0 } else { -1.0 };
                accel[0] += sign * 1.5;
                gyro[2] += sign * 0.8;
            }
        }

        RawSample::new(accel, gyro, device_timestamp_ms)
    }
}

/// Paced generator standing in for the platform sensor
pub struct SyntheticSource {
    profile: SyntheticProfile,
}

impl SyntheticSource {
    pub fn new(profile: SyntheticProfile) -> Self {
        Self { profile }
    }
}

impl SensorSource for SyntheticSource {
    fn open(&self) -> Result<Receiver<SourceEvent>, SampleStreamError> {
        if self.profile.rate_hz == 0 {
            return Err(SampleStreamError::Unavailable(
                "sample rate must be positive".to_string(),
            ));
        }

        let profile = self.profile.clone();
        // Small queue: a stalled consumer should see gaps, not unbounded growth
        let (tx, rx) = bounded(profile.rate_hz as usize * 2);

        thread::spawn(move || {
            let period = Duration::from_secs_f64(1.0 / profile.rate_hz as f64);
            let opened = Instant::now();
            let base_ms = chrono::Utc::now().timestamp_millis();
            let mut index = 0u64;

            loop {
                if profile.limit.is_some_and(|limit| index as usize >= limit) {
                    break;
                }

                let elapsed_ms = opened.elapsed().as_millis() as i64;
                let sample = profile.sample_at(index, elapsed_ms, base_ms + elapsed_ms);

                match tx.try_send(Ok(sample)) {
                    Ok(()) => {}
                    Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                        log::debug!("Synthetic source stopped after {} samples", index);
                        break;
                    }
                    Err(crossbeam_channel::TrySendError::Full(_)) => {
                        // Consumer is behind, drop this sample
                    }
                }
                index += 1;

                let next = opened + period * index as u32;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                }
            }
        });

        Ok(rx)
    }
}
