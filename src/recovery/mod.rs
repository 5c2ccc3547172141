//! Recovery manager - periodic crash-safe snapshots of in-memory tickets
//!
//! While the store runs on memory the recovery file is the only copy of
//! newly written tickets that survives a crash. The manager owns that file,
//! its `.bak` rotation and the autosave task.
pub mod snapshot;

use crate::restore::FallbackTrigger;
use crate::status::lock;
use crate::storage::TicketRecord;
use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use snapshot::{
    backup_path, read_snapshot, temp_path, write_snapshot, RecoverySnapshot, SNAPSHOT_VERSION,
};

/// Everything held outside the database that a restart must not lose
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingState {
    pub tickets: Vec<TicketRecord>,

    /// Database tickets deleted while writes went to memory
    pub deleted_ids: Vec<String>,
    pub trigger: Option<FallbackTrigger>,
}

impl PendingState {
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.deleted_ids.is_empty()
    }
}

impl From<Vec<TicketRecord>> for PendingState {
    fn from(tickets: Vec<TicketRecord>) -> Self {
        Self {
            tickets,
            ..Self::default()
        }
    }
}

/// Supplies the live pending state to the autosave task
pub type ItemProvider = Arc<dyn Fn() -> PendingState + Send + Sync>;

/// Recovery manager settings
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// Canonical snapshot file
    pub path: PathBuf,

    pub autosave_interval: Duration,

    /// Oldest snapshot still restored at startup
    pub max_age: Duration,

    /// Age after which `.bak` and stray `.tmp` files are deleted
    pub backup_retention: Duration,
}

impl RecoveryConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            autosave_interval: Duration::from_secs(30),
            max_age: Duration::from_secs(24 * 60 * 60),
            backup_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Diagnostics for the CLI and logs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub path: PathBuf,
    pub active: bool,
    pub save_count: u64,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_saved_count: usize,
    pub last_error: Option<String>,
    pub snapshot_exists: bool,
    pub backup_exists: bool,
}

#[derive(Debug, Default)]
struct SaveState {
    save_count: u64,
    last_saved_at: Option<DateTime<Utc>>,
    last_saved_count: usize,
    last_error: Option<String>,

    /// The file on disk was written or adopted by this manager
    owns_snapshot: bool,
}

struct Shared {
    config: RecoveryConfig,

    /// Serializes writers; never held across an await
    save_state: Mutex<SaveState>,
    provider: Mutex<Option<ItemProvider>>,
}

impl Shared {
    fn save(&self, pending: PendingState) -> StorageResult<usize> {
        let mut state = lock(&self.save_state);
        let snapshot = RecoverySnapshot::new(pending.tickets)
            .with_deleted_ids(pending.deleted_ids)
            .with_trigger(pending.trigger);
        let count = snapshot.ticket_count;

        match write_snapshot(&self.config.path, &snapshot) {
            Ok(()) => {
                state.save_count += 1;
                state.last_saved_at = Some(snapshot.timestamp);
                state.last_saved_count = count;
                state.last_error = None;
                state.owns_snapshot = true;
                tracing::debug!(
                    path = %self.config.path.display(),
                    tickets = count,
                    deletions = snapshot.deleted_ids.len(),
                    saves = state.save_count,
                    "Recovery snapshot saved"
                );
                Ok(count)
            }
            Err(e) => {
                tracing::error!(
                    path = %self.config.path.display(),
                    error = %e,
                    "Failed to save recovery snapshot"
                );
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// An empty state only overwrites a snapshot this manager owns
    fn sync(&self, pending: PendingState) -> StorageResult<Option<usize>> {
        if pending.is_empty() && !lock(&self.save_state).owns_snapshot {
            tracing::trace!("No pending tickets to snapshot");
            return Ok(None);
        }
        self.save(pending).map(Some)
    }

    fn autosave_tick(&self) {
        let provider = lock(&self.provider).clone();
        let Some(provider) = provider else {
            return;
        };

        // Errors are recorded in the save state and logged by save()
        let _ = self.sync(provider());
    }
}

struct AutosaveWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<()>,
}

impl AutosaveWorker {
    fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.join_handle.abort();
    }
}

/// Owner of the recovery snapshot file
pub struct RecoveryManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<AutosaveWorker>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                save_state: Mutex::new(SaveState::default()),
                provider: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.shared.config
    }

    /// Canonical snapshot path
    pub fn path(&self) -> &Path {
        &self.shared.config.path
    }

    /// Start the autosave task.
    ///
    /// Returns false if autosave was already running or no tokio runtime is
    /// available.
    pub fn start(&self, provider: ItemProvider) -> bool {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            tracing::warn!("Recovery autosave already running");
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Cannot start recovery autosave without a runtime");
                return false;
            }
        };

        *lock(&self.shared.provider) = Some(provider);

        let interval = self.shared.config.autosave_interval.max(Duration::from_millis(10));
        let shared = Arc::clone(&self.shared);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => shared.autosave_tick(),
                }
            }
        });

        tracing::info!(
            path = %self.shared.config.path.display(),
            interval = %humantime::format_duration(interval),
            "Recovery autosave started"
        );

        *worker = Some(AutosaveWorker {
            stop_tx: Some(stop_tx),
            join_handle,
        });
        true
    }

    /// Stop the autosave task; stopping a stopped manager does nothing
    pub fn stop(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.stop();
            tracing::info!("Recovery autosave stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Immediate save using the provider registered by `start`
    pub fn save_now(&self) -> StorageResult<usize> {
        let provider = lock(&self.shared.provider).clone();
        match provider {
            Some(provider) => self.shared.save(provider()),
            None => Err(StorageError::Unavailable(
                "recovery autosave has no ticket provider".to_string(),
            )),
        }
    }

    /// Immediate save of an explicit ticket set
    pub fn save_items(&self, tickets: &[TicketRecord]) -> StorageResult<usize> {
        self.shared.save(PendingState::from(tickets.to_vec()))
    }

    /// Immediate save of tickets, pending deletions and trigger
    pub fn save_pending(&self, pending: PendingState) -> StorageResult<usize> {
        self.shared.save(pending)
    }

    /// Bring the snapshot in line with the live state.
    ///
    /// Once this manager has written or adopted the file, an empty state
    /// replaces it with an empty snapshot so drained tickets cannot come
    /// back. A foreign snapshot is left alone. Returns `None` when nothing
    /// was written.
    pub fn sync(&self, pending: PendingState) -> StorageResult<Option<usize>> {
        self.shared.sync(pending)
    }

    /// Take responsibility for the snapshot on disk after loading it
    pub fn adopt(&self) {
        lock(&self.shared.save_state).owns_snapshot = true;
    }

    /// Load the snapshot regardless of age; `None` if absent or malformed
    pub fn load_recovery_data(&self) -> Option<RecoverySnapshot> {
        let snapshot = read_snapshot(self.path())?;
        tracing::info!(
            path = %self.path().display(),
            tickets = snapshot.ticket_count,
            taken_at = %snapshot.timestamp.to_rfc3339(),
            "Loaded recovery snapshot"
        );
        Some(snapshot)
    }

    /// Load the snapshot only if it is worth restoring
    pub fn load_usable(&self) -> Option<RecoverySnapshot> {
        self.load_usable_at(Utc::now())
    }

    pub fn load_usable_at(&self, now: DateTime<Utc>) -> Option<RecoverySnapshot> {
        let snapshot = self.load_recovery_data()?;
        let max_age = self.shared.config.max_age;

        if snapshot.is_usable_at(max_age, now) {
            Some(snapshot)
        } else {
            tracing::info!(
                tickets = snapshot.ticket_count,
                age = %humantime::format_duration(snapshot.age_at(now)),
                max_age = %humantime::format_duration(max_age),
                "Recovery snapshot is empty or too old, ignoring it"
            );
            None
        }
    }

    /// Delete the canonical snapshot, typically after a complete restore
    pub fn clear(&self) -> StorageResult<bool> {
        let mut state = lock(&self.shared.save_state);
        state.owns_snapshot = false;
        match fs::remove_file(self.path()) {
            Ok(()) => {
                tracing::info!(path = %self.path().display(), "Recovery snapshot cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `.bak` and stray `.tmp` files older than the retention window
    pub fn cleanup(&self) -> StorageResult<usize> {
        self.cleanup_older_than(self.shared.config.backup_retention)
    }

    pub fn cleanup_older_than(&self, retention: Duration) -> StorageResult<usize> {
        let Some(dir) = self.path().parent() else {
            return Ok(0);
        };
        if !dir.is_dir() {
            return Ok(0);
        }

        let _state = lock(&self.shared.save_state);
        let now = SystemTime::now();
        let mut removed = 0;

        let escaped = glob::Pattern::escape(&dir.to_string_lossy());
        for suffix in ["*.bak", "*.tmp"] {
            let pattern = format!("{}{}{}", escaped, std::path::MAIN_SEPARATOR, suffix);
            let entries = glob::glob(&pattern)
                .map_err(|e| StorageError::other(format!("invalid cleanup pattern: {}", e)))?;

            for entry in entries.flatten() {
                let modified = match fs::metadata(&entry).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) => {
                        tracing::debug!(path = %entry.display(), error = %e, "Skipping unreadable backup");
                        continue;
                    }
                };

                let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < retention {
                    continue;
                }

                match fs::remove_file(&entry) {
                    Ok(()) => {
                        removed += 1;
                        tracing::debug!(path = %entry.display(), "Removed stale recovery file");
                    }
                    Err(e) => {
                        tracing::warn!(path = %entry.display(), error = %e, "Failed to remove stale recovery file");
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale recovery files");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> RecoveryStats {
        let state = lock(&self.shared.save_state);
        RecoveryStats {
            path: self.path().to_path_buf(),
            active: self.is_active(),
            save_count: state.save_count,
            last_saved_at: state.last_saved_at,
            last_saved_count: state.last_saved_count,
            last_error: state.last_error.clone(),
            snapshot_exists: self.path().exists(),
            backup_exists: backup_path(self.path()).exists(),
        }
    }
}

impl Drop for RecoveryManager {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.stop();
        }
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.shared.config)
            .field("active", &self.is_active())
            .finish()
    }
}
