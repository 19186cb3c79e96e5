//! Flash-style key-value storage and the settings record adapter.
//!
//! Backends follow the NVS model: values live under a key inside a namespace,
//! writes are staged on an open handle and only become visible on `commit`.
//! [`SettingsStore`] is the only component that writes the persisted record.

pub mod file;
pub mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;
#[cfg(test)]
pub use memory::FaultPoint;

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Namespace holding the settings record.
pub const NAMESPACE: &str = "smart_home";
/// Key of the settings record inside [`NAMESPACE`].
pub const RECORD_KEY: &str = "device_data";

/// Longest namespace or key name, in bytes.
pub const MAX_NAME_LEN: usize = 15;
/// Longest string value, in bytes.
pub const MAX_VALUE_LEN: usize = 4000;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("Namespace or key not found")]
    NotFound,
    #[error("Invalid namespace or key name: {0:?}")]
    InvalidName(String),
    #[error("Value too long: {0} bytes")]
    ValueTooLong(usize),
    #[error("Handle opened read-only")]
    ReadOnly,
    #[error("Stored value is corrupted: {0}")]
    Corrupted(String),
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(test)]
    #[error("Injected fault: {0:?}")]
    Fault(FaultPoint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A flash-backed key-value partition.
pub trait KvBackend: Send + Sync {
    /// Opens a namespace.
    ///
    /// Opening a namespace that was never written in [`OpenMode::ReadOnly`]
    /// fails with [`KvError::NotFound`]; read-write mode creates it.
    fn open(&self, namespace: &str, mode: OpenMode) -> Result<Box<dyn KvHandle + '_>, KvError>;
}

/// An open namespace.
pub trait KvHandle {
    /// Reads a committed string value.
    fn get_str(&self, key: &str) -> Result<String, KvError>;

    /// Stages a string value. Invisible to readers until [`KvHandle::commit`].
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), KvError>;

    /// Publishes all staged values. On failure the previous values stay in place.
    fn commit(&mut self) -> Result<(), KvError>;
}

pub(crate) fn check_name(name: &str) -> Result<(), KvError> {
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if name.is_empty() || name.len() > MAX_NAME_LEN || !valid_chars {
        return Err(KvError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn check_value(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(KvError::ValueTooLong(value.len()));
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open storage: {0}")]
    Open(#[source] KvError),
    #[error("Failed to write settings: {0}")]
    Write(#[source] KvError),
    #[error("Failed to commit settings: {0}")]
    Commit(#[source] KvError),
}

/// Reads and writes the encoded settings record.
///
/// Saves are serialized so that two concurrent writers never interleave
/// their open/write/commit sequences.
pub struct SettingsStore {
    backend: Arc<dyn KvBackend>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the stored record string verbatim.
    ///
    /// `None` when nothing was ever saved or when the backend cannot be read.
    pub fn load(&self) -> Option<String> {
        let handle = match self.backend.open(NAMESPACE, OpenMode::ReadOnly) {
            Ok(handle) => handle,
            Err(KvError::NotFound) => {
                debug!("Namespace {} not found, no settings saved yet", NAMESPACE);
                return None;
            }
            Err(e) => {
                error!("Failed to open namespace {}: {}", NAMESPACE, e);
                return None;
            }
        };

        match handle.get_str(RECORD_KEY) {
            Ok(raw) => Some(raw),
            Err(KvError::NotFound) => {
                debug!("Key {} not found, no settings saved yet", RECORD_KEY);
                None
            }
            Err(e) => {
                warn!("Failed to read {}: {}", RECORD_KEY, e);
                None
            }
        }
    }

    /// Replaces the stored record string.
    pub fn save(&self, raw: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        let mut handle = self
            .backend
            .open(NAMESPACE, OpenMode::ReadWrite)
            .map_err(StoreError::Open)
            .inspect_err(|e| error!("{}", e))?;
        handle
            .set_str(RECORD_KEY, raw)
            .map_err(StoreError::Write)
            .inspect_err(|e| error!("{}", e))?;
        handle
            .commit()
            .map_err(StoreError::Commit)
            .inspect_err(|e| error!("{}", e))?;

        info!("Settings saved ({} bytes)", raw.len());
        Ok(())
    }
}
