//! Recovery snapshot file format and crash-safe writes
//!
//! The canonical file is only ever replaced by a rename, so a reader sees
//! either the previous complete snapshot or the new one.
use crate::restore::FallbackTrigger;
use crate::storage::TicketRecord;
use crate::StorageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Snapshot format version written by this crate
pub const SNAPSHOT_VERSION: &str = "1.0.0";

/// Contents of the recovery file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    pub version: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub ticket_count: usize,
    pub tickets: Vec<TicketRecord>,

    /// Database tickets deleted while writes went to memory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_ids: Vec<String>,

    /// Failure that moved the store off durable storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<FallbackTrigger>,
}

impl RecoverySnapshot {
    /// Snapshot of `tickets` taken now
    pub fn new(tickets: Vec<TicketRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now(),
            ticket_count: tickets.len(),
            tickets,
            deleted_ids: Vec::new(),
            trigger: None,
        }
    }

    pub fn with_deleted_ids(mut self, deleted_ids: Vec<String>) -> Self {
        self.deleted_ids = deleted_ids;
        self
    }

    pub fn with_trigger(mut self, trigger: Option<FallbackTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Nothing to carry into the next session
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.deleted_ids.is_empty()
    }

    /// Age relative to `now`; snapshots from the future count as fresh
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// Non-empty and not older than `max_age`
    pub fn is_usable_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        !self.is_empty() && self.age_at(now) <= max_age
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<snapshot>.bak`, holding the previous snapshot
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

/// `<snapshot>.tmp`, only present while a write is in progress
pub fn temp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

/// Write a snapshot crash-safely.
///
/// 1. write and fsync `<path>.tmp`
/// 2. copy the current snapshot to `<path>.bak` (failure is logged only)
/// 3. rename the temp file over `<path>`
pub fn write_snapshot(path: &Path, snapshot: &RecoverySnapshot) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let temp = temp_path(path);

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    if path.exists() {
        let backup = backup_path(path);
        if let Err(e) = fs::copy(path, &backup) {
            tracing::warn!(
                path = %backup.display(),
                error = %e,
                "Failed to rotate recovery backup, continuing"
            );
        }
    }

    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    Ok(())
}

/// Read a snapshot; absent, unreadable or malformed files yield `None`
pub fn read_snapshot(path: &Path) -> Option<RecoverySnapshot> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot read recovery snapshot");
            return None;
        }
    };

    match serde_json::from_slice::<RecoverySnapshot>(&bytes) {
        Ok(mut snapshot) => {
            if snapshot.ticket_count != snapshot.tickets.len() {
                tracing::warn!(
                    path = %path.display(),
                    declared = snapshot.ticket_count,
                    actual = snapshot.tickets.len(),
                    "Recovery snapshot count mismatch, trusting ticket list"
                );
                snapshot.ticket_count = snapshot.tickets.len();
            }
            Some(snapshot)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Ignoring malformed recovery snapshot"
            );
            None
        }
    }
}
