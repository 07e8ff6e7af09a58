//! Durable key-value records
//!
//! The device identity and the network credentials are two independently
//! keyed JSON records. Each write replaces a record atomically: the file
//! backend writes a temp file and renames it over the old one.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Key of the device identity record
pub const IDENTITY_KEY: &str = "device_data";
/// Key of the network credentials record
pub const CREDENTIALS_KEY: &str = "wifi_data";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt record {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Store is read-only")]
    ReadOnly,
}

/// Durable key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read a record; `Ok(None)` when the key was never written
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a record atomically
    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read(key)?.is_some())
    }
}

/// Read and decode a JSON record
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.read(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    store.write(key, &bytes)
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// In-memory store for tests
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    read_only: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn set_read_only(&self, read_only: bool) {
        *self.read_only.lock() = read_only;
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        if *self.read_only.lock() {
            return Err(StorageError::ReadOnly);
        }
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Directory backed store, one file per key
pub struct FileStore {
    dir: PathBuf,
    fsync_on_write: bool,
}

impl FileStore {
    /// Open (and create) the store directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Storage: Opened record store at {:?}", dir);
        Ok(Self {
            dir,
            fsync_on_write: true,
        })
    }

    /// Skip fsync, for tests on tmpfs
    pub fn without_fsync(mut self) -> Self {
        self.fsync_on_write = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        match fs::read(self.record_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.record_path(key);
        let temp_path = self.dir.join(format!("{}.json.tmp", key));

        // Write temp file then rename (atomic)
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(value)?;
            if self.fsync_on_write {
                file.sync_all()?;
            }
        }
        fs::rename(&temp_path, &path)?;

        debug!("Storage: Wrote record {} ({} bytes)", key, value.len());
        Ok(())
    }
}
