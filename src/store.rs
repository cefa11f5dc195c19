//! Durable text-file store used by the persistence workers.
//!
//! The trait exists so the retry and failure paths can be driven by a
//! fault-injecting store in tests; `FsStore` is the real implementation.

use crate::error::StorageError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

pub trait FileStore: Send + Sync {
    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError>;
    fn exists(&self, path: &Path) -> bool;
    /// Append text, creating the file if missing
    fn append(&self, path: &Path, text: &str) -> Result<(), StorageError>;
    fn read_to_string(&self, path: &Path) -> Result<String, StorageError>;
    /// Replace the whole file atomically
    fn overwrite(&self, path: &Path, text: &str) -> Result<(), StorageError>;
    fn remove(&self, path: &Path) -> Result<(), StorageError>;
}

/// `std::fs` backed store
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStore;

impl FileStore for FsStore {
    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(path).map_err(|e| StorageError::from_io("create directory", &e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn append(&self, path: &Path, text: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StorageError::from_io("open for append", &e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| StorageError::from_io("append", &e))?;
        file.flush().map_err(|e| StorageError::from_io("flush", &e))
    }

    fn read_to_string(&self, path: &Path) -> Result<String, StorageError> {
        fs::read_to_string(path).map_err(|e| StorageError::from_io("read", &e))
    }

    fn overwrite(&self, path: &Path, text: &str) -> Result<(), StorageError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| StorageError::from_io("create temp file", &e))?;
            file.write_all(text.as_bytes())
                .map_err(|e| StorageError::from_io("write temp file", &e))?;
            file.sync_all()
                .map_err(|e| StorageError::from_io("sync temp file", &e))?;
        }

        fs::rename(&tmp, path).map_err(|e| StorageError::from_io("replace file", &e))
    }

    fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io("remove", &e)),
        }
    }
}
