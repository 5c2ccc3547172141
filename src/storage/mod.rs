//! Ticket storage backends
//!
//! The durable backend is SQLite; the in-memory backend stands in for it
//! while the database is unusable. Both hold tickets as opaque JSON objects
//! keyed by their string `id`.
pub mod memory;
pub mod paths;
pub mod sqlite;

use crate::{StorageError, StorageResult};
use std::path::PathBuf;

pub use memory::MemoryTicketStore;
pub use paths::{
    default_alternate_paths, default_primary_path, default_recovery_path, probe_candidate,
    resolve_backing_path, workspace_key, BackingMode, ProbeResult, ResolvedBacking, HIDDEN_DIR,
};
pub use sqlite::SqliteTicketStore;

/// Opaque ticket document
pub type TicketRecord = serde_json::Value;

/// Storage backend for ticket records
#[cfg_attr(test, mockall::automock)]
pub trait TicketStore: Send {
    /// Insert or replace a ticket
    fn insert(&mut self, record: &TicketRecord) -> StorageResult<()>;

    /// Fetch a ticket by id
    fn get(&self, id: &str) -> StorageResult<Option<TicketRecord>>;

    /// All tickets, ordered by id
    fn list(&self) -> StorageResult<Vec<TicketRecord>>;

    /// Remove a ticket; returns whether it existed
    fn remove(&mut self, id: &str) -> StorageResult<bool>;

    fn count(&self) -> StorageResult<usize>;

    /// File backing the store, `None` for memory
    fn location(&self) -> Option<PathBuf>;

    /// Check the backing file is sound before trusting it with tickets
    fn verify(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Extract the string id of a ticket record
pub fn record_id(record: &TicketRecord) -> StorageResult<&str> {
    if !record.is_object() {
        return Err(StorageError::InvalidRecord(
            "ticket must be a JSON object".to_string(),
        ));
    }

    match record.get("id").and_then(|id| id.as_str()) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(StorageError::InvalidRecord(
            "ticket has no string id".to_string(),
        )),
    }
}

/// Best-effort id for log lines and error messages
pub fn display_id(record: &TicketRecord) -> String {
    match record.get("id") {
        Some(serde_json::Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => "<no id>".to_string(),
    }
}
