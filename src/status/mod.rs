//! Operating-mode state machine
//!
//! The [`StatusManager`] is the single owner of the store's
//! [`OperatingStatus`]. Every change goes through
//! [`StatusManager::transition_to`]; observers receive an owned copy of the
//! new status and cannot reach the live instance.
//!
//! ```text
//!            full / permission / corruption
//!   Primary ───────────────────────────────► Fallback
//!      ▲  ▲                                   │  ▲
//!      │  └──────── restore migration ────────┘  │
//!      │                                          │
//!      └────────────── Recovering ◄──────────────┘
//!                 (snapshot reconstruction)
//! ```
pub mod degradation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub use degradation::{
    active_degradations, degradation_messages, status_degradations, DegradationRule, DegradationType,
    DEGRADATION_RULES,
};

/// Operating mode of the ticket store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Durable backing store in use
    Primary,

    /// Durable store unusable, in-memory substitute in use
    Fallback,

    /// Reconstructing tickets from a recovery snapshot
    Recovering,
}

impl OperatingMode {
    /// Health implied by the mode
    pub fn health(&self) -> Health {
        match self {
            OperatingMode::Primary => Health::Healthy,
            OperatingMode::Fallback => Health::Degraded,
            OperatingMode::Recovering => Health::Critical,
        }
    }

    /// Severity ordering: Primary < Fallback < Recovering
    pub fn rank(&self) -> u8 {
        match self {
            OperatingMode::Primary => 0,
            OperatingMode::Fallback => 1,
            OperatingMode::Recovering => 2,
        }
    }

    /// Row of the feature availability matrix for this mode
    pub fn features(&self) -> BTreeMap<Feature, bool> {
        let row: [bool; 6] = match self {
            //                      crud   search persist snapshot pooling history
            OperatingMode::Primary => [true, true, true, true, true, true],
            OperatingMode::Fallback => [true, false, false, true, false, false],
            OperatingMode::Recovering => [true, false, false, false, false, false],
        };

        Feature::ALL.iter().copied().zip(row).collect()
    }

    /// Feature row adjusted for where tickets are written.
    ///
    /// Fallback onto an alternate database still persists tickets.
    pub fn features_at(&self, location: Option<&Path>) -> BTreeMap<Feature, bool> {
        let mut features = self.features();
        if *self == OperatingMode::Fallback && location.is_some() {
            features.insert(Feature::Persistence, true);
        }
        features
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Primary => write!(f, "primary"),
            OperatingMode::Fallback => write!(f, "fallback"),
            OperatingMode::Recovering => write!(f, "recovering"),
        }
    }
}

/// Health level derived from the mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Degraded => write!(f, "degraded"),
            Health::Critical => write!(f, "critical"),
        }
    }
}

/// Feature whose availability depends on the mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Crud,
    Search,
    Persistence,
    RecoverySnapshot,
    Pooling,
    History,
}

impl Feature {
    /// Matrix column order
    pub const ALL: [Feature; 6] = [
        Feature::Crud,
        Feature::Search,
        Feature::Persistence,
        Feature::RecoverySnapshot,
        Feature::Pooling,
        Feature::History,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Crud => "crud",
            Feature::Search => "search",
            Feature::Persistence => "persistence",
            Feature::RecoverySnapshot => "recoverySnapshot",
            Feature::Pooling => "pooling",
            Feature::History => "history",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|feature| feature.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown feature: {}", s))
    }
}

/// Snapshot of the store's operating state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingStatus {
    pub mode: OperatingMode,
    pub health: Health,
    pub backing_location: Option<PathBuf>,
    pub is_fallback: bool,
    pub mode_changed_at: DateTime<Utc>,
    pub reason: String,
    pub transition_count: u64,
    pub available_features: BTreeMap<Feature, bool>,
    pub last_error: Option<String>,
}

impl OperatingStatus {
    /// Status for a freshly constructed manager
    pub fn initial(mode: OperatingMode, location: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            mode,
            health: mode.health(),
            is_fallback: mode != OperatingMode::Primary,
            mode_changed_at: Utc::now(),
            reason: reason.into(),
            transition_count: 0,
            available_features: mode.features_at(location.as_deref()),
            backing_location: location,
            last_error: None,
        }
    }

    /// Check a feature against this snapshot
    pub fn is_feature_available(&self, feature: Feature) -> bool {
        self.available_features.get(&feature).copied().unwrap_or(false)
    }

    /// In fallback but still writing to a database file
    pub fn on_alternate(&self) -> bool {
        self.mode == OperatingMode::Fallback && self.backing_location.is_some()
    }
}

/// Status change listener; errors are logged and never propagate
pub type StatusListener = Arc<dyn Fn(&OperatingStatus) -> anyhow::Result<()> + Send + Sync>;

type ListenerRegistry = Mutex<Vec<(u64, StatusListener)>>;

/// Handle returned by [`StatusManager::on_status_change`]
#[must_use = "dropping the subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    /// Listener id within the manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener; returns false if it was already gone
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => {
                let mut listeners = lock(&registry);
                let before = listeners.len();
                listeners.retain(|(id, _)| *id != self.id);
                listeners.len() != before
            }
            None => false,
        }
    }
}

/// Single source of truth for the operating mode
pub struct StatusManager {
    status: Mutex<OperatingStatus>,
    listeners: Arc<ListenerRegistry>,
    next_listener_id: Mutex<u64>,
}

impl StatusManager {
    /// Create a manager in the given initial mode
    pub fn new(initial_mode: OperatingMode, location: Option<PathBuf>) -> Self {
        Self::with_status(OperatingStatus::initial(
            initial_mode,
            location,
            "initialized",
        ))
    }

    /// Create a manager from an explicit initial status
    pub fn with_status(status: OperatingStatus) -> Self {
        Self {
            status: Mutex::new(status),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: Mutex::new(1),
        }
    }

    /// Owned copy of the current status
    pub fn get_status(&self) -> OperatingStatus {
        lock(&self.status).clone()
    }

    /// Current mode
    pub fn mode(&self) -> OperatingMode {
        lock(&self.status).mode
    }

    pub fn is_fallback(&self) -> bool {
        lock(&self.status).is_fallback
    }

    pub fn is_healthy(&self) -> bool {
        lock(&self.status).health == Health::Healthy
    }

    pub fn is_feature_available(&self, feature: Feature) -> bool {
        lock(&self.status).is_feature_available(feature)
    }

    /// Feature lookup by name; unknown names are unavailable
    pub fn is_feature_named(&self, name: &str) -> bool {
        name.parse::<Feature>()
            .map(|feature| self.is_feature_available(feature))
            .unwrap_or(false)
    }

    /// Degradation messages for the current status
    pub fn degradation_messages(&self) -> Vec<String> {
        degradation_messages(&self.get_status())
    }

    /// Move to a new mode.
    ///
    /// Returns false without notifying anyone when both the mode and the
    /// backing location are unchanged.
    pub fn transition_to(
        &self,
        mode: OperatingMode,
        reason: impl Into<String>,
        location: Option<&Path>,
        last_error: Option<String>,
    ) -> bool {
        let (previous, snapshot) = {
            let mut status = lock(&self.status);

            if status.mode == mode && status.backing_location.as_deref() == location {
                return false;
            }

            let previous = status.mode;
            *status = OperatingStatus {
                mode,
                health: mode.health(),
                backing_location: location.map(Path::to_path_buf),
                is_fallback: mode != OperatingMode::Primary,
                mode_changed_at: Utc::now(),
                reason: reason.into(),
                transition_count: status.transition_count + 1,
                available_features: mode.features_at(location),
                last_error,
            };

            (previous, status.clone())
        };

        match snapshot.health {
            Health::Healthy => tracing::info!(
                from = %previous,
                to = %snapshot.mode,
                reason = %snapshot.reason,
                transitions = snapshot.transition_count,
                "Storage mode changed"
            ),
            Health::Degraded | Health::Critical => tracing::warn!(
                from = %previous,
                to = %snapshot.mode,
                reason = %snapshot.reason,
                location = ?snapshot.backing_location,
                transitions = snapshot.transition_count,
                "Storage mode changed"
            ),
        }

        self.notify(&snapshot);
        true
    }

    /// Register a listener for status changes
    pub fn on_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OperatingStatus) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = {
            let mut next = lock(&self.next_listener_id);
            let id = *next;
            *next += 1;
            id
        };

        lock(&self.listeners).push((id, Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn notify(&self, status: &OperatingStatus) {
        // Listeners may subscribe or unsubscribe from inside the callback
        let listeners: Vec<(u64, StatusListener)> = lock(&self.listeners).clone();

        for (id, listener) in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(status))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(listener = id, error = %e, "Status listener failed");
                }
                Err(_) => {
                    tracing::error!(listener = id, "Status listener panicked");
                }
            }
        }
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new(OperatingMode::Primary, None)
    }
}

impl fmt::Debug for StatusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusManager")
            .field("status", &self.get_status())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
