pub mod dispatcher;
pub mod manager;
pub mod models;
pub mod session;
pub mod store;

pub use dispatcher::CommandDispatcher;
pub use manager::DeviceManager;
pub use models::*;
pub use store::{DeviceStore, SharedState};

use serde::Serialize;

use crate::inventory::InventoryError;
use crate::serial::SerialError;

/// Caller-visible error classes; the boundary layer maps each to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LinkUnavailable,
    Validation,
    State,
    UnknownMedication,
    ModeMismatch,
    InsufficientInventory,
    DeviceSyncFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device link unavailable: {0}")]
    LinkUnavailable(#[from] SerialError),

    #[error("No valid response to {command} after {attempts} attempts")]
    NoResponse { command: String, attempts: u32 },

    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("{0}")]
    State(String),

    #[error("Medication '{0}' not found")]
    UnknownMedication(String),

    #[error("{0}")]
    ModeMismatch(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("Failed to sync {operation} to device, local change reverted: {source}")]
    DeviceSyncFailure {
        operation: String,
        #[source]
        source: SerialError,
    },
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::LinkUnavailable(_) | DeviceError::NoResponse { .. } => {
                ErrorKind::LinkUnavailable
            }
            DeviceError::Validation(_) => ErrorKind::Validation,
            DeviceError::State(_) => ErrorKind::State,
            DeviceError::UnknownMedication(_) => ErrorKind::UnknownMedication,
            DeviceError::ModeMismatch(_) => ErrorKind::ModeMismatch,
            DeviceError::Inventory(InventoryError::Insufficient { .. }) => {
                ErrorKind::InsufficientInventory
            }
            DeviceError::Inventory(_) => ErrorKind::Validation,
            DeviceError::DeviceSyncFailure { .. } => ErrorKind::DeviceSyncFailure,
        }
    }

    pub(crate) fn sync_failure(operation: &str, source: SerialError) -> Self {
        DeviceError::DeviceSyncFailure {
            operation: operation.to_string(),
            source,
        }
    }

    pub(crate) fn no_active_medication() -> Self {
        DeviceError::State("No active medication selected".to_string())
    }

    pub(crate) fn no_session() -> Self {
        DeviceError::State("No active medication session, start one first".to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
