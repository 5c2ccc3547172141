/// Common test helper functions

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use ticketvault::error::RetryConfig;
use ticketvault::ResilienceConfig;

/// Minimum fallback age used by the fast test configuration
pub const TEST_RESTORE_MIN_AGE: Duration = Duration::from_millis(50);

/// Config for a temporary workspace with no alternates and fast timings
pub fn fast_config(workspace: &Path) -> ResilienceConfig {
    let mut config = ResilienceConfig::for_workspace(workspace);
    config.alternate_paths = Some(Vec::new());
    config.retry = RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    };
    config.autosave_interval = Duration::from_millis(20);
    config.restore_check_interval = Duration::from_millis(20);
    config.restore_min_age = TEST_RESTORE_MIN_AGE;
    config.migration_batch_size = 2;
    config
}

/// A path that can never be created: its parent is a regular file
pub fn blocked_path(dir: &TempDir) -> PathBuf {
    let file = dir.path().join("not-a-directory");
    std::fs::write(&file, b"occupied").expect("write blocker file");
    file.join("tickets.db")
}

/// Minimal ticket document
pub fn ticket(id: &str, title: &str) -> Value {
    json!({ "id": id, "title": title })
}

/// Ticket with all migration defaults already present
pub fn full_ticket(id: &str, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "status": "in-progress",
        "version": 3,
        "created_at": "2026-01-01T00:00:00.000Z",
        "updated_at": "2026-01-02T00:00:00.000Z"
    })
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
