//! Backing-path resolution
//!
//! Decides at startup where tickets live: the workspace database, one of
//! the alternates under the user's home or temp directory, or memory. The
//! restore monitor reuses [`probe_candidate`] so both agree on what
//! "writable" means.
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Per-project hidden directory
pub const HIDDEN_DIR: &str = ".ticketvault";

/// Database file name
pub const DATABASE_FILE: &str = "tickets.db";

/// Recovery snapshot file name
pub const RECOVERY_FILE: &str = "tickets-recovery.json";

const PROBE_FILE: &str = ".ticketvault-write-probe";

/// Result of probing one candidate path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub path: PathBuf,
    pub writable: bool,

    /// Why the candidate was rejected
    pub reason: Option<String>,
}

impl ProbeResult {
    fn accepted(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            writable: true,
            reason: None,
        }
    }

    fn rejected(path: &Path, reason: String) -> Self {
        tracing::debug!(path = %path.display(), reason = %reason, "Backing path rejected");
        Self {
            path: path.to_path_buf(),
            writable: false,
            reason: Some(reason),
        }
    }
}

/// Check whether a database path can be used for durable writes.
///
/// Creates the parent directory if needed, then opens an existing file for
/// append (never truncating it) or creates and removes a probe file next to
/// it. Every failure becomes `writable: false`.
pub fn probe_candidate(path: &Path) -> ProbeResult {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };

    if let Err(e) = fs::create_dir_all(parent) {
        return ProbeResult::rejected(
            path,
            format!("cannot create directory {}: {}", parent.display(), e),
        );
    }

    if path.is_dir() {
        return ProbeResult::rejected(path, "path is a directory".to_string());
    }

    if path.exists() {
        return match OpenOptions::new().append(true).open(path) {
            Ok(_) => ProbeResult::accepted(path),
            Err(e) => ProbeResult::rejected(path, format!("cannot open for writing: {}", e)),
        };
    }

    let probe = parent.join(PROBE_FILE);
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
    {
        Ok(file) => {
            drop(file);
            if let Err(e) = fs::remove_file(&probe) {
                tracing::debug!(path = %probe.display(), error = %e, "Failed to remove write probe");
            }
            ProbeResult::accepted(path)
        }
        Err(e) => ProbeResult::rejected(
            path,
            format!("directory {} is not writable: {}", parent.display(), e),
        ),
    }
}

/// Which candidate the resolver picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "index")]
pub enum BackingMode {
    Primary,

    /// Index into the alternates list
    Alternate(usize),

    Memory,
}

impl fmt::Display for BackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingMode::Primary => write!(f, "primary"),
            BackingMode::Alternate(index) => write!(f, "alternate #{}", index + 1),
            BackingMode::Memory => write!(f, "memory"),
        }
    }
}

/// Outcome of backing-path resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedBacking {
    pub mode: BackingMode,
    pub path: Option<PathBuf>,
    pub reason: String,

    /// Every probe made, in order
    pub probes: Vec<ProbeResult>,
}

impl ResolvedBacking {
    pub fn is_durable(&self) -> bool {
        self.mode != BackingMode::Memory
    }
}

/// Pick the first writable candidate: primary, then alternates in order
pub fn resolve_backing_path(primary: &Path, alternates: &[PathBuf]) -> ResolvedBacking {
    let mut probes = Vec::with_capacity(alternates.len() + 1);

    let probe = probe_candidate(primary);
    let writable = probe.writable;
    probes.push(probe);
    if writable {
        tracing::info!(path = %primary.display(), "Using primary ticket database");
        return ResolvedBacking {
            mode: BackingMode::Primary,
            path: Some(primary.to_path_buf()),
            reason: "primary path is writable".to_string(),
            probes,
        };
    }

    for (index, alternate) in alternates.iter().enumerate() {
        let probe = probe_candidate(alternate);
        let writable = probe.writable;
        probes.push(probe);

        if writable {
            tracing::warn!(
                primary = %primary.display(),
                alternate = %alternate.display(),
                "Primary ticket database unusable, using alternate location"
            );
            return ResolvedBacking {
                mode: BackingMode::Alternate(index),
                path: Some(alternate.clone()),
                reason: format!(
                    "primary path is not writable ({})",
                    probes[0].reason.as_deref().unwrap_or("unknown")
                ),
                probes,
            };
        }
    }

    tracing::warn!(
        primary = %primary.display(),
        alternates = alternates.len(),
        "No writable ticket database location, keeping tickets in memory"
    );

    ResolvedBacking {
        mode: BackingMode::Memory,
        path: None,
        reason: "no writable location found".to_string(),
        probes,
    }
}

/// `<workspace>/.ticketvault/tickets.db`
pub fn default_primary_path(workspace: &Path) -> PathBuf {
    workspace.join(HIDDEN_DIR).join(DATABASE_FILE)
}

/// `<workspace>/.ticketvault/recovery/tickets-recovery.json`
pub fn default_recovery_path(workspace: &Path) -> PathBuf {
    workspace
        .join(HIDDEN_DIR)
        .join("recovery")
        .join(RECOVERY_FILE)
}

/// Alternates under the home directory, then the temp directory
pub fn default_alternate_paths(workspace: &Path) -> Vec<PathBuf> {
    let key = workspace_key(workspace);
    let mut alternates = Vec::with_capacity(2);

    if let Some(base) = directories::BaseDirs::new() {
        alternates.push(
            base.home_dir()
                .join(HIDDEN_DIR)
                .join(&key)
                .join(DATABASE_FILE),
        );
    }

    alternates.push(
        std::env::temp_dir()
            .join("ticketvault")
            .join(&key)
            .join(DATABASE_FILE),
    );

    alternates
}

/// Stable directory name identifying a workspace outside of it
///
/// `<last component>-<8 hex digits of FNV-1a over the full path>`
pub fn workspace_key(workspace: &Path) -> String {
    let name: String = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    let mut hash: u32 = 0x811c_9dc5;
    for byte in workspace.to_string_lossy().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }

    format!("{}-{:08x}", name, hash)
}
