//! Status - キューの状態を数える

use serde::{Deserialize, Serialize};

use super::coordinator::Inner;
use crate::domain::{LifecycleDir, QueueError};

/// File counts per lifecycle directory, plus this process's in-memory view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub locked: usize,
    pub completed: usize,
    pub failed: usize,
    pub manual_retry: usize,

    /// Tasks in the in-memory ready queue.
    pub ready: usize,

    /// Tasks this process is running right now.
    pub in_flight: usize,
}

impl QueueCounts {
    pub fn get(&self, dir: LifecycleDir) -> usize {
        match dir {
            LifecycleDir::Pending => self.pending,
            LifecycleDir::Locked => self.locked,
            LifecycleDir::Completed => self.completed,
            LifecycleDir::Failed => self.failed,
            LifecycleDir::ManualRetry => self.manual_retry,
        }
    }
}

pub(crate) async fn collect(inner: &Inner) -> Result<QueueCounts, QueueError> {
    let mut counts = QueueCounts::default();
    for dir in LifecycleDir::ALL {
        let n = inner.store.count(dir).await?;
        match dir {
            LifecycleDir::Pending => counts.pending = n,
            LifecycleDir::Locked => counts.locked = n,
            LifecycleDir::Completed => counts.completed = n,
            LifecycleDir::Failed => counts.failed = n,
            LifecycleDir::ManualRetry => counts.manual_retry = n,
        }
    }
    let state = inner.state.lock().await;
    counts.ready = state.ready.len();
    counts.in_flight = state.locked.len();
    Ok(counts)
}
