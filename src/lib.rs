// Allow complex types where needed for listener registries and async closures
#![allow(clippy::type_complexity)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod restore;
pub mod status;
pub mod storage;

// Re-export the main entry points for convenience
pub use config::ResilienceConfig;
pub use orchestrator::{inspect, ResilientTicketStore, StoreInspection, WriteReport};
pub use status::{Feature, Health, OperatingMode, OperatingStatus, StatusManager};
pub use storage::{MemoryTicketStore, SqliteTicketStore, TicketRecord, TicketStore};

use thiserror::Error;

/// Errors raised by ticket storage operations.
///
/// Most call sites never match on these directly: the classifier in
/// [`error::classification`] turns them into a retry/fallback decision.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid ticket record: {0}")]
    InvalidRecord(String),

    #[error("Ticket not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Build an error from an arbitrary message
    pub fn other(message: impl Into<String>) -> Self {
        StorageError::Other(message.into())
    }
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Other(format!("{:#}", err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod lib_tests;
