//! # Error Types Module
//!
//! Centralized error handling for the roadscan pipeline.
//! Provides custom error types for each module with proper context and error chaining.
//!
//! ## Error Types
//! - `ConfigError`: Configuration file I/O, parsing and validation errors
//! - `StorageError`: Durable store failures, classified for the retry policy
//! - `ClockError`: Reference clock fetch failures (always degraded, never fatal)
//! - `SampleStreamError`: Failures of the live sensor stream
//! - `SessionError`: Recording lifecycle misuse and fatal session failures
//! - `ProfileError`: Calibration profile persistence errors
//!
//! ## Retry Classification
//! Only `StorageError::TransientIo` is retried by the persistence workers.
//! `AccessDenied` and `StorageFull` are fatal for the session and surface
//! immediately.

use std::fmt;
use std::io;

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(io::Error),
    /// Failed to write config file
    WriteFailed(io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// A setting is outside its allowed range
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid setting `{}`: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Errors raised by the durable store and the persistence workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Retryable I/O failure (busy file, interrupted write, ...)
    TransientIo(String),
    /// Destination is not writable; fatal for the session
    AccessDenied(String),
    /// Device has no space left; fatal for the session
    StorageFull(String),
    /// Persisted rows could not be parsed back
    Corrupt(String),
}

impl StorageError {
    /// Classify an I/O error for the retry policy
    pub fn from_io(context: &str, err: &io::Error) -> Self {
        let message = format!("{}: {}", context, err);
        match err.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                StorageError::AccessDenied(message)
            }
            io::ErrorKind::StorageFull => StorageError::StorageFull(message),
            _ => StorageError::TransientIo(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::TransientIo(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::AccessDenied(_) | StorageError::StorageFull(_)
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::TransientIo(msg) => write!(f, "Transient I/O failure: {}", msg),
            StorageError::AccessDenied(msg) => write!(f, "Storage access denied: {}", msg),
            StorageError::StorageFull(msg) => write!(f, "Storage full: {}", msg),
            StorageError::Corrupt(msg) => write!(f, "Persisted data is corrupt: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors that can occur while fetching the reference clock
#[derive(Debug)]
pub enum ClockError {
    /// Network or socket failure talking to the time server
    Unavailable(io::Error),
    /// Server replied with something that is not a usable time packet
    BadResponse(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::Unavailable(e) => write!(f, "Reference clock unavailable: {}", e),
            ClockError::BadResponse(msg) => {
                write!(f, "Reference clock returned a bad response: {}", msg)
            }
        }
    }
}

impl std::error::Error for ClockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClockError::Unavailable(e) => Some(e),
            ClockError::BadResponse(_) => None,
        }
    }
}

/// Errors delivered on the sensor stream
#[derive(Debug, Clone, PartialEq)]
pub enum SampleStreamError {
    /// The sensor could not be started
    Unavailable(String),
    /// The sensor reported a failure mid-stream
    Failed(String),
}

impl fmt::Display for SampleStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleStreamError::Unavailable(msg) => write!(f, "Sensor unavailable: {}", msg),
            SampleStreamError::Failed(msg) => write!(f, "Sensor stream failed: {}", msg),
        }
    }
}

impl std::error::Error for SampleStreamError {}

/// Errors that can occur while managing a recording session
#[derive(Debug)]
pub enum SessionError {
    /// A session is already recording
    AlreadyRecording,
    /// No session is recording
    NotRecording,
    /// Another consumer (calibration or recording) holds the sensor
    SourceBusy,
    /// The sensor stream could not be opened
    Stream(SampleStreamError),
    /// The session directory could not be prepared
    Storage(StorageError),
    /// Invalid pipeline settings
    Config(ConfigError),
    /// The ingestion thread went away
    IngestGone,
    /// The persistence workers have shut down
    WritePoolClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyRecording => write!(f, "Recording already in progress"),
            SessionError::NotRecording => write!(f, "No recording in progress"),
            SessionError::SourceBusy => {
                write!(f, "Sensor is in use by another calibration or recording")
            }
            SessionError::Stream(e) => write!(f, "{}", e),
            SessionError::Storage(e) => write!(f, "{}", e),
            SessionError::Config(e) => write!(f, "{}", e),
            SessionError::IngestGone => write!(f, "Ingestion thread stopped unexpectedly"),
            SessionError::WritePoolClosed => write!(f, "Persistence workers are shut down"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Stream(e) => Some(e),
            SessionError::Storage(e) => Some(e),
            SessionError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        SessionError::Storage(e)
    }
}

impl From<SampleStreamError> for SessionError {
    fn from(e: SampleStreamError) -> Self {
        SessionError::Stream(e)
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(e)
    }
}

/// Errors that can occur while persisting the calibration profile
#[derive(Debug)]
pub enum ProfileError {
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    ParseFailed(toml::de::Error),
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::ReadFailed(e) => write!(f, "Failed to read calibration profile: {}", e),
            ProfileError::WriteFailed(e) => {
                write!(f, "Failed to write calibration profile: {}", e)
            }
            ProfileError::ParseFailed(e) => {
                write!(f, "Failed to parse calibration profile: {}", e)
            }
            ProfileError::SerializeFailed(e) => {
                write!(f, "Failed to serialize calibration profile: {}", e)
            }
        }
    }
}

impl std::error::Error for ProfileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProfileError::ReadFailed(e) => Some(e),
            ProfileError::WriteFailed(e) => Some(e),
            ProfileError::ParseFailed(e) => Some(e),
            ProfileError::SerializeFailed(e) => Some(e),
        }
    }
}
