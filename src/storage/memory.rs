//! In-memory ticket store used while the database is unusable
use super::{record_id, TicketRecord, TicketStore};
use crate::StorageResult;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Volatile store keyed by ticket id
#[derive(Debug, Clone, Default)]
pub struct MemoryTicketStore {
    tickets: BTreeMap<String, TicketRecord>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record, ordered by id
    pub fn snapshot(&self) -> Vec<TicketRecord> {
        self.tickets.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn clear(&mut self) {
        self.tickets.clear();
    }
}

impl TicketStore for MemoryTicketStore {
    fn insert(&mut self, record: &TicketRecord) -> StorageResult<()> {
        let id = record_id(record)?.to_string();
        self.tickets.insert(id, record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> StorageResult<Option<TicketRecord>> {
        Ok(self.tickets.get(id).cloned())
    }

    fn list(&self) -> StorageResult<Vec<TicketRecord>> {
        Ok(self.snapshot())
    }

    fn remove(&mut self, id: &str) -> StorageResult<bool> {
        Ok(self.tickets.remove(id).is_some())
    }

    fn count(&self) -> StorageResult<usize> {
        Ok(self.tickets.len())
    }

    fn location(&self) -> Option<PathBuf> {
        None
    }
}
