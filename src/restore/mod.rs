//! Restore monitor - detects when durable storage is usable again
//!
//! Polls the same write probe the startup resolver uses and, once a
//! candidate is writable, lets the owner migrate in-memory tickets back.
//! The monitor never changes the operating mode itself.
use crate::error::ErrorCategory;
use crate::status::{lock, OperatingMode};
use crate::storage::{display_id, probe_candidate, TicketRecord};
use crate::StorageResult;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default status for migrated tickets that have none
pub const DEFAULT_TICKET_STATUS: &str = "open";

/// Default document version for migrated tickets that have none
pub const DEFAULT_TICKET_VERSION: u64 = 1;

/// Record of one switch into fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackTrigger {
    pub triggered_at: DateTime<Utc>,
    pub error: String,
    pub category: ErrorCategory,
    pub item_count_at_trigger: usize,
    pub previous_mode: OperatingMode,
}

impl FallbackTrigger {
    pub fn new(
        error: impl Into<String>,
        category: ErrorCategory,
        item_count_at_trigger: usize,
        previous_mode: OperatingMode,
    ) -> Self {
        Self {
            triggered_at: Utc::now(),
            error: error.into(),
            category,
            item_count_at_trigger,
            previous_mode,
        }
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.triggered_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Restore monitor settings
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreConfig {
    pub primary_path: PathBuf,
    pub alternate_paths: Vec<PathBuf>,
    pub check_interval: Duration,

    /// Minimum time spent in fallback before a restore is attempted
    pub max_age: Duration,
    pub batch_size: usize,
}

impl RestoreConfig {
    pub fn new(primary_path: impl Into<PathBuf>, alternate_paths: Vec<PathBuf>) -> Self {
        Self {
            primary_path: primary_path.into(),
            alternate_paths,
            check_interval: Duration::from_secs(60),
            max_age: Duration::from_secs(5 * 60),
            batch_size: 50,
        }
    }
}

/// Outcome of one eligibility check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreCheck {
    pub can_restore: bool,
    pub target_path: Option<PathBuf>,
    pub reason: String,
    pub checked_at: DateTime<Utc>,
}

/// Outcome of a migration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    pub items_migrated: usize,
    pub target_path: Option<PathBuf>,

    /// `"<id>: <error>"` per failed ticket
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub failed_ids: Vec<String>,
}

impl RestoreResult {
    /// Result for a restore that was refused before migrating anything
    pub fn refused(target_path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            items_migrated: 0,
            target_path,
            errors: vec![reason.into()],
            duration_ms: 0,
            failed_ids: Vec::new(),
        }
    }

    pub fn with_target(mut self, target_path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(target_path.into());
        self
    }
}

/// Probe the primary path, then each alternate; the first writable wins
pub fn check_eligibility(config: &RestoreConfig) -> RestoreCheck {
    let candidates = std::iter::once(&config.primary_path).chain(config.alternate_paths.iter());
    let mut rejections = Vec::new();

    for (index, candidate) in candidates.enumerate() {
        let probe = probe_candidate(candidate);
        if probe.writable {
            let reason = if index == 0 {
                "primary path is writable".to_string()
            } else {
                format!("alternate path #{} is writable", index)
            };
            return RestoreCheck {
                can_restore: true,
                target_path: Some(probe.path),
                reason,
                checked_at: Utc::now(),
            };
        }
        rejections.push(format!(
            "{}: {}",
            candidate.display(),
            probe.reason.unwrap_or_else(|| "not writable".to_string())
        ));
    }

    RestoreCheck {
        can_restore: false,
        target_path: None,
        reason: format!("no writable location ({})", rejections.join("; ")),
        checked_at: Utc::now(),
    }
}

/// Called with the check that flipped `can_restore` to true
pub type RestoreReadyCallback = Arc<dyn Fn(RestoreCheck) + Send + Sync>;

struct MonitorState {
    last_check: Option<RestoreCheck>,
}

struct PollWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<()>,
}

impl PollWorker {
    fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.join_handle.abort();
    }
}

/// Background poller for restore eligibility
pub struct RestoreMonitor {
    config: RestoreConfig,
    state: Arc<Mutex<MonitorState>>,
    worker: Mutex<Option<PollWorker>>,
}

impl RestoreMonitor {
    pub fn new(config: RestoreConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MonitorState { last_check: None })),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Start polling; `on_ready` fires each time `can_restore` turns true
    pub fn start(&self, on_ready: RestoreReadyCallback) -> bool {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            tracing::warn!("Restore monitor already running");
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Cannot start restore monitor without a runtime");
                return false;
            }
        };

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let interval = config.check_interval.max(Duration::from_millis(10));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = handle.spawn(async move {
            let mut was_ready = false;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {
                        let check = record_check(&state, &config);
                        let ready = check.can_restore;
                        if ready && !was_ready {
                            tracing::info!(
                                path = ?check.target_path,
                                "Durable storage is writable again"
                            );
                            on_ready(check);
                        }
                        was_ready = ready;
                    }
                }
            }
        });

        tracing::info!(
            interval = %humantime::format_duration(interval),
            primary = %self.config.primary_path.display(),
            "Restore monitor started"
        );

        *worker = Some(PollWorker {
            stop_tx: Some(stop_tx),
            join_handle,
        });
        true
    }

    /// Stop polling; stopping a stopped monitor does nothing
    pub fn stop(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.stop();
            tracing::info!("Restore monitor stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Out-of-band eligibility check, recorded as the last check
    pub fn check_now(&self) -> RestoreCheck {
        record_check(&self.state, &self.config)
    }

    pub fn last_check(&self) -> Option<RestoreCheck> {
        lock(&self.state).last_check.clone()
    }
}

impl Drop for RestoreMonitor {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.stop();
        }
    }
}

fn record_check(state: &Mutex<MonitorState>, config: &RestoreConfig) -> RestoreCheck {
    let check = check_eligibility(config);
    tracing::debug!(
        can_restore = check.can_restore,
        reason = %check.reason,
        "Restore eligibility checked"
    );
    lock(state).last_check = Some(check.clone());
    check
}

/// Fill fields the durable schema expects, keeping any value already set
pub fn prepare_for_migration(items: Vec<TicketRecord>) -> Vec<TicketRecord> {
    prepare_for_migration_at(items, Utc::now())
}

pub fn prepare_for_migration_at(items: Vec<TicketRecord>, now: DateTime<Utc>) -> Vec<TicketRecord> {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(mut fields) => {
                fill_missing(&mut fields, "created_at", Value::String(timestamp.clone()));
                fill_missing(&mut fields, "updated_at", Value::String(timestamp.clone()));
                fill_missing(&mut fields, "status", Value::String(DEFAULT_TICKET_STATUS.to_string()));
                fill_missing(&mut fields, "version", Value::from(DEFAULT_TICKET_VERSION));
                Value::Object(fields)
            }
            other => other,
        })
        .collect()
}

fn fill_missing(fields: &mut Map<String, Value>, key: &str, value: Value) {
    match fields.get(key) {
        Some(existing) if !existing.is_null() => {}
        _ => {
            fields.insert(key.to_string(), value);
        }
    }
}

/// Insert `items` in batches of `batch_size`.
///
/// A failed ticket is recorded and the migration moves on; `success` is true
/// only when nothing failed.
pub async fn execute_migration<F, Fut>(
    items: &[TicketRecord],
    mut inserter: F,
    batch_size: usize,
) -> RestoreResult
where
    F: FnMut(TicketRecord) -> Fut,
    Fut: Future<Output = StorageResult<()>>,
{
    let started = Instant::now();
    let batch_size = batch_size.max(1);
    let total_batches = items.len().div_ceil(batch_size);

    let mut migrated = 0;
    let mut errors = Vec::new();
    let mut failed_ids = Vec::new();

    for (batch_index, batch) in items.chunks(batch_size).enumerate() {
        for item in batch {
            match inserter(item.clone()).await {
                Ok(()) => migrated += 1,
                Err(e) => {
                    let id = display_id(item);
                    tracing::warn!(ticket = %id, error = %e, "Failed to migrate ticket");
                    errors.push(format!("{}: {}", id, e));
                    failed_ids.push(id);
                }
            }
        }

        tracing::debug!(
            batch = batch_index + 1,
            batches = total_batches,
            migrated,
            "Migration batch finished"
        );
        tokio::task::yield_now().await;
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let success = failed_ids.is_empty();

    if success {
        tracing::info!(migrated, duration_ms, "Migrated tickets to durable storage");
    } else {
        tracing::warn!(
            migrated,
            failed = failed_ids.len(),
            duration_ms,
            "Migration finished with failures"
        );
    }

    RestoreResult {
        success,
        items_migrated: migrated,
        target_path: None,
        errors,
        duration_ms,
        failed_ids,
    }
}

/// Whether a fallback is old enough, and of a kind, worth restoring from
pub fn should_attempt_restore(trigger: &FallbackTrigger, max_age: Duration) -> bool {
    should_attempt_restore_at(trigger, max_age, Utc::now())
}

pub fn should_attempt_restore_at(
    trigger: &FallbackTrigger,
    max_age: Duration,
    now: DateTime<Utc>,
) -> bool {
    if trigger.age_at(now) < max_age {
        return false;
    }

    match trigger.category {
        ErrorCategory::Full | ErrorCategory::Permission => true,
        // Needs an operator to look at the damaged file first
        ErrorCategory::Corruption => false,
        ErrorCategory::Busy | ErrorCategory::Unknown => false,
    }
}

/// Display helper for a restore target
pub fn describe_target(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "memory".to_string())
}
