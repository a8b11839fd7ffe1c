//! Lifecycle state of a task, encoded by the directory its file lives in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A lifecycle directory under `<data_dir>/async-tasks/`.
///
/// State transitions:
/// - Pending -> Locked -> Completed
/// - Pending -> Locked -> Pending (retry with backoff, loop until the budget runs out)
/// - Pending -> Locked -> Failed (never_retry, permanent error, or budget exhausted)
/// - ManualRetry -> Pending (operator drops a file in, the watcher ingests it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleDir {
    Pending,
    Locked,
    Completed,
    Failed,
    ManualRetry,
}

impl LifecycleDir {
    pub const ALL: [LifecycleDir; 5] = [
        LifecycleDir::Pending,
        LifecycleDir::Locked,
        LifecycleDir::Completed,
        LifecycleDir::Failed,
        LifecycleDir::ManualRetry,
    ];

    /// Directories holding tasks that still count against the dedup index.
    pub const LIVE: [LifecycleDir; 2] = [LifecycleDir::Pending, LifecycleDir::Locked];

    pub fn dir_name(self) -> &'static str {
        match self {
            LifecycleDir::Pending => "pending",
            LifecycleDir::Locked => "locked",
            LifecycleDir::Completed => "completed",
            LifecycleDir::Failed => "failed",
            LifecycleDir::ManualRetry => "manualRetry",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleDir::Completed | LifecycleDir::Failed)
    }

    pub fn is_live(self) -> bool {
        matches!(self, LifecycleDir::Pending | LifecycleDir::Locked)
    }
}

impl fmt::Display for LifecycleDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}
