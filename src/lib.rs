//! # roadscan
//!
//! Road-surface sensing pipeline for a phone (or any 6-axis IMU) mounted in
//! a vehicle. Live accelerometer/gyroscope samples are smoothed, corrected
//! with a stored calibration profile, checked for bumps and written to
//! per-session CSV files by a small pool of background writers.
//!
//! ## Modules
//! - `sensor`: sample sources and exclusive access to them
//! - `calibration`: orientation + offset calibration state machine
//! - `conditioner` / `detector`: per-sample smoothing, correction, bump flag
//! - `recorder`: session lifecycle and the ingestion pipeline
//! - `writer` / `store`: persistence workers over a durable file store
//! - `timesync`: reference clock offset and hybrid session timestamps
//!
//! Logging goes through the `log` facade; pick a backend in the binary.

pub mod broadcast;
pub mod calibration;
pub mod conditioner;
pub mod config;
pub mod detector;
pub mod error;
pub mod profile;
pub mod recorder;
pub mod sample;
pub mod sensor;
pub mod store;
pub mod timesync;
pub mod writer;

pub use calibration::{run_calibration, CalibrationOutcome, CalibrationState, CalibrationWindow};
pub use config::Config;
pub use profile::{CalibrationProfile, Orientation, ProfileStore, SessionCalibration};
pub use recorder::{SessionRecorder, SessionReport};
pub use sample::{Annotation, CorrectedSample, RawSample};
pub use sensor::SensorHub;
