//! # Configuration Management Module
//!
//! Persistent pipeline settings stored in platform-appropriate locations.
//! Handles loading, saving, validating and providing defaults.
//!
//! ## Sections
//! - `pipeline`: buffer capacity, worker pool size, retry policy, output directory
//! - `signal`: smoothing factor, refractory window, fallback event threshold
//! - `calibration`: window lengths, movement thresholds, acceptance ratio
//! - `clock`: reference time server and synchronization bound
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/roadscan/config.toml
//! - Linux: ~/.config/roadscan/config.toml
//! - Windows: %APPDATA%\roadscan\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Samples buffered before an automatic flush (~3 s at 100 Hz)
    pub buffer_capacity: usize,
    pub max_concurrent_writes: usize,
    /// Additional attempts after the first failed write
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Consecutive failed flushes before the failure callback fires
    pub failure_threshold: u32,
    pub stop_timeout_ms: u64,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 300,
            max_concurrent_writes: 3,
            max_retries: 2,
            retry_delay_ms: 500,
            failure_threshold: 3,
            stop_timeout_ms: 10_000,
            output_dir: default_output_dir(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub ema_alpha: f64,
    pub refractory_ms: i64,
    /// Used when no pre-recording calibration produced a threshold
    pub default_event_threshold: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.8,
            refractory_ms: 8_000,
            default_event_threshold: 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub sample_rate_hz: u32,
    pub orientation_window_ms: i64,
    pub offset_window_ms: i64,
    pub session_offset_window_ms: i64,
    pub safety_timeout_ms: u64,
    pub accel_movement_threshold: f64,
    pub gyro_movement_threshold: f64,
    pub movement_abort_count: u32,
    pub min_sample_ratio: f64,
    pub event_threshold_margin: f64,
    pub event_threshold_sigma: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 100,
            orientation_window_ms: 1_000,
            offset_window_ms: 15_000,
            session_offset_window_ms: 3_000,
            safety_timeout_ms: 20_000,
            accel_movement_threshold: 0.3,
            gyro_movement_threshold: 0.2,
            movement_abort_count: 10,
            min_sample_ratio: 0.7,
            event_threshold_margin: 3.0,
            event_threshold_sigma: 6.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub ntp_server: String,
    pub max_uncertainty_ms: i64,
    pub query_timeout_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org:123".to_string(),
            max_uncertainty_ms: 100,
            query_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub signal: SignalConfig,
    pub calibration: CalibrationConfig,
    pub clock: ClockConfig,
}

fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roadscan")
        .join("sessions")
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Config {
    /// Get the directory holding config and calibration files
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roadscan")
    }

    /// Get the path to the config file
    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config: Config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(ConfigError::ParseFailed)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                config
            }
            Err(e) => return Err(ConfigError::ReadFailed(e)),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let alpha = self.signal.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(invalid("signal.ema_alpha", format!("{} is not in (0, 1]", alpha)));
        }
        if self.signal.refractory_ms < 0 {
            return Err(invalid("signal.refractory_ms", "must not be negative"));
        }
        if self.pipeline.buffer_capacity == 0 {
            return Err(invalid("pipeline.buffer_capacity", "must be at least 1"));
        }
        if self.pipeline.max_concurrent_writes == 0 {
            return Err(invalid("pipeline.max_concurrent_writes", "must be at least 1"));
        }
        if self.pipeline.failure_threshold == 0 {
            return Err(invalid("pipeline.failure_threshold", "must be at least 1"));
        }

        let cal = &self.calibration;
        if cal.sample_rate_hz == 0 {
            return Err(invalid("calibration.sample_rate_hz", "must be at least 1"));
        }
        if cal.orientation_window_ms <= 0
            || cal.offset_window_ms <= 0
            || cal.session_offset_window_ms <= 0
        {
            return Err(invalid("calibration", "window lengths must be positive"));
        }
        if !(cal.min_sample_ratio > 0.0 && cal.min_sample_ratio <= 1.0) {
            return Err(invalid(
                "calibration.min_sample_ratio",
                format!("{} is not in (0, 1]", cal.min_sample_ratio),
            ));
        }
        if cal.movement_abort_count == 0 {
            return Err(invalid("calibration.movement_abort_count", "must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.buffer_capacity, 300);
        assert_eq!(config.pipeline.max_concurrent_writes, 3);
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.retry_delay_ms, 500);
        assert_eq!(config.signal.refractory_ms, 8_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization_fills_defaults() {
        let toml_str = r#"
            [pipeline]
            buffer_capacity = 50

            [signal]
            ema_alpha = 0.5
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.pipeline.buffer_capacity, 50);
        assert_eq!(config.pipeline.max_concurrent_writes, 3);
        assert_eq!(config.signal.ema_alpha, 0.5);
        assert_eq!(config.calibration.offset_window_ms, 15_000);
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let mut config = Config::default();
        config.signal.ema_alpha = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "signal.ema_alpha", .. })
        ));

        config.signal.ema_alpha = 1.5;
        assert!(config.validate().is_err());

        config.signal.ema_alpha = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_creates_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
