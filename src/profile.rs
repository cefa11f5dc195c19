//! # Calibration Profiles
//!
//! `CalibrationProfile` is the long-lived result of the initial calibration;
//! it is written once as a flat TOML record next to the config file and is
//! only replaced by a newer successful calibration or an explicit clear.
//! `SessionCalibration` is the short pre-recording adjustment that lives for
//! one session only.

use crate::config::Config;
use crate::error::ProfileError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Standard gravity, m/s²
pub const GRAVITY: f64 = 9.81;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    Flat,
    Portrait,
    LandscapeLeft,
    LandscapeRight,
    Unknown,
}

impl Orientation {
    pub fn name(&self) -> &'static str {
        match self {
            Orientation::Flat => "flat",
            Orientation::Portrait => "portrait",
            Orientation::LandscapeLeft => "landscapeLeft",
            Orientation::LandscapeRight => "landscapeRight",
            Orientation::Unknown => "unknown",
        }
    }

    /// Landscape mounts report road-forward motion on the other horizontal axis
    pub fn swaps_xy(&self) -> bool {
        matches!(self, Orientation::LandscapeLeft | Orientation::LandscapeRight)
    }

    /// Gravity as seen by the accelerometer when the device rests in this orientation.
    ///
    /// `Unknown` falls back to the flat expectation.
    pub fn expected_gravity(&self) -> [f64; 3] {
        match self {
            Orientation::Flat | Orientation::Unknown => [0.0, 0.0, GRAVITY],
            Orientation::Portrait => [0.0, -GRAVITY, 0.0],
            Orientation::LandscapeLeft => [-GRAVITY, 0.0, 0.0],
            Orientation::LandscapeRight => [GRAVITY, 0.0, 0.0],
        }
    }

    /// Expected gravity for a mount whose mean reading is `measured`.
    ///
    /// `Portrait` covers upright and inverted mounts, so its Y sign follows
    /// the measurement.
    pub fn gravity_for(&self, measured: [f64; 3]) -> [f64; 3] {
        match self {
            Orientation::Portrait if measured[1] > 0.0 => [0.0, GRAVITY, 0.0],
            _ => self.expected_gravity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub orientation: Orientation,
    pub accel_offset_x: f64,
    pub accel_offset_y: f64,
    pub accel_offset_z: f64,
    pub gyro_offset_x: f64,
    pub gyro_offset_y: f64,
    pub gyro_offset_z: f64,
    pub created_at: DateTime<Utc>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            orientation: Orientation::Unknown,
            accel_offset_x: 0.0,
            accel_offset_y: 0.0,
            accel_offset_z: 0.0,
            gyro_offset_x: 0.0,
            gyro_offset_y: 0.0,
            gyro_offset_z: 0.0,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl CalibrationProfile {
    pub fn accel_offsets(&self) -> [f64; 3] {
        [self.accel_offset_x, self.accel_offset_y, self.accel_offset_z]
    }

    pub fn gyro_offsets(&self) -> [f64; 3] {
        [self.gyro_offset_x, self.gyro_offset_y, self.gyro_offset_z]
    }
}

/// Per-recording adjustment on top of the stored profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionCalibration {
    pub session_accel_offset_z: f64,
    pub gyro_z_drift: f64,
    pub event_threshold: f64,
}

impl SessionCalibration {
    /// No adjustment, detection at the given threshold
    pub fn neutral(event_threshold: f64) -> Self {
        Self {
            session_accel_offset_z: 0.0,
            gyro_z_drift: 0.0,
            event_threshold,
        }
    }
}

/// Flat-file persistence for the calibration profile
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store next to the config file
    pub fn default_location() -> Self {
        Self::new(Config::config_dir().join("calibration.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored profile, `None` when no calibration has been saved
    pub fn load(&self) -> Result<Option<CalibrationProfile>, ProfileError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let profile = toml::from_str(&contents).map_err(ProfileError::ParseFailed)?;
                Ok(Some(profile))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProfileError::ReadFailed(e)),
        }
    }

    pub fn save(&self, profile: &CalibrationProfile) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(ProfileError::WriteFailed)?;
        }

        let contents = toml::to_string_pretty(profile).map_err(ProfileError::SerializeFailed)?;
        fs::write(&self.path, contents).map_err(ProfileError::WriteFailed)?;

        log::info!(
            "Saved calibration profile ({}) to {}",
            profile.orientation.name(),
            self.path.display()
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<(), ProfileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Cleared calibration profile");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProfileError::WriteFailed(e)),
        }
    }
}
