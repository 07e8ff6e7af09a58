//! Crate-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::connectivity::LinkError;
use crate::firmware::SlotError;
use crate::lock::LockError;
use crate::provision::ProvisionError;
use crate::queue::QueueError;
use crate::storage::StorageError;
use crate::update::UpdateError;

/// Errors surfaced by the runtime core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Network error: {0}")]
    Link(#[from] LinkError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("Firmware slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Subsystem {name} failed: {reason}")]
    Subsystem { name: String, reason: String },

    #[error("Route already registered: {0}")]
    DuplicateRoute(String),
}

impl CoreError {
    pub fn subsystem(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Subsystem {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
