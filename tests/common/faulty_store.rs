/// SQLite ticket store with an injectable write fault
///
/// Reads always pass through; inserts and removals fail with the injected
/// SQLite message while a fault is set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use ticketvault::orchestrator::StoreOpener;
use ticketvault::{SqliteTicketStore, StorageError, StorageResult, TicketRecord, TicketStore};

pub const DISK_FULL_MESSAGE: &str = "SQLITE_FULL: database or disk is full";
pub const CORRUPT_MESSAGE: &str = "SQLITE_CORRUPT: database disk image is malformed";

/// Shared fault switch and counters
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    fault: Arc<Mutex<Option<&'static str>>>,
    rejected_writes: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl FaultSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill_disk(&self) {
        self.set_fault(Some(DISK_FULL_MESSAGE));
    }

    pub fn corrupt(&self) {
        self.set_fault(Some(CORRUPT_MESSAGE));
    }

    /// Writes succeed again
    pub fn clear_fault(&self) {
        self.set_fault(None);
    }

    fn set_fault(&self, fault: Option<&'static str>) {
        *self.fault.lock().unwrap() = fault;
    }

    fn current_fault(&self) -> Option<&'static str> {
        *self.fault.lock().unwrap()
    }

    pub fn rejected_writes(&self) -> usize {
        self.rejected_writes.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn reject(&self) -> StorageResult<()> {
        if let Some(message) = self.current_fault() {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::other(message));
        }
        Ok(())
    }

    /// Opener producing faulty stores that share this switch
    pub fn opener(&self) -> StoreOpener {
        let switch = self.clone();
        Arc::new(move |path: &Path| {
            switch.opened.fetch_add(1, Ordering::SeqCst);
            let store = FaultyStore {
                inner: SqliteTicketStore::open(path)?,
                switch: switch.clone(),
            };
            Ok(Box::new(store) as Box<dyn TicketStore>)
        })
    }
}

pub struct FaultyStore {
    inner: SqliteTicketStore,
    switch: FaultSwitch,
}

impl TicketStore for FaultyStore {
    fn insert(&mut self, record: &TicketRecord) -> StorageResult<()> {
        self.switch.reject()?;
        self.inner.insert(record)
    }

    fn get(&self, id: &str) -> StorageResult<Option<TicketRecord>> {
        self.inner.get(id)
    }

    fn list(&self) -> StorageResult<Vec<TicketRecord>> {
        self.inner.list()
    }

    fn remove(&mut self, id: &str) -> StorageResult<bool> {
        self.switch.reject()?;
        self.inner.remove(id)
    }

    fn count(&self) -> StorageResult<usize> {
        self.inner.count()
    }

    fn location(&self) -> Option<PathBuf> {
        self.inner.location()
    }

    fn verify(&self) -> StorageResult<()> {
        self.inner.verify()
    }
}
