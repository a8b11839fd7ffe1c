//! Recovery - 起動時に lifecycle ディレクトリからキャッシュを再構築する
//!
//! # フロー
//! 1. ディレクトリを作成し、書きかけの一時ファイルを掃除。completed/ と failed/ の
//!    ファイル名から id を拾い、再発行しないようにする
//! 2. `pending/` を読み、ReadyQueue と DedupIndex に載せる
//! 3. `locked/` に残っているもの = 前回プロセスの実行中にクラッシュした試行。
//!    失敗 1 回として扱い、pending/ か failed/ へ戻す
//! 4. `manualRetry/` に溜まっているファイルを取り込む
//!
//! 壊れたファイルは failed/ に隔離し、残りの復旧は続ける。

use tracing::{error, info, warn};

use super::coordinator::{Inner, QueueState};
use crate::domain::{LifecycleDir, QueueError, TaskError, TaskRecord, task_id_from_file_name};
use crate::ports::ScanEntry;

pub(crate) const CRASH_RECOVERY_MESSAGE: &str =
    "recovered after crash: task was locked when the previous process stopped";

/// What a recovery pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks admitted from `pending/`.
    pub admitted: usize,

    /// Crash-locked tasks sent back to `pending/`.
    pub requeued: usize,

    /// Crash-locked tasks that ran out of attempts and went to `failed/`.
    pub failed: usize,

    /// Unreadable files moved to `failed/`.
    pub quarantined: usize,

    /// Files taken in from `manualRetry/`.
    pub manual_ingested: usize,
}

pub(crate) async fn recover(inner: &Inner) -> Result<RecoveryReport, QueueError> {
    inner.store.ensure_layout().await?;

    observe_finished_ids(inner).await?;

    let mut report = {
        let mut state = inner.state.lock().await;
        let mut report = reload_pending(inner, &mut state).await?;
        recover_locked(inner, &mut state, &mut report).await?;
        report
    };

    for name in inner.store.list_file_names(LifecycleDir::ManualRetry).await? {
        if super::manual_retry::ingest(inner, &name).await?.is_some() {
            report.manual_ingested += 1;
        }
    }

    info!(
        admitted = report.admitted,
        requeued = report.requeued,
        failed = report.failed,
        quarantined = report.quarantined,
        manual_ingested = report.manual_ingested,
        "recovery scan finished"
    );
    Ok(report)
}

/// Ids in `completed/` and `failed/` must not be reissued. Only the file
/// names are parsed.
async fn observe_finished_ids(inner: &Inner) -> Result<(), QueueError> {
    for dir in [LifecycleDir::Completed, LifecycleDir::Failed] {
        for name in inner.store.list_file_names(dir).await? {
            if let Some(id) = task_id_from_file_name(&name) {
                inner.ids.observe(id);
            }
        }
    }
    Ok(())
}

/// Rebuild the ready queue and dedup index from `pending/`.
///
/// Tasks claimed by this process keep their dedup keys.
pub(crate) async fn reload_pending(
    inner: &Inner,
    state: &mut QueueState,
) -> Result<RecoveryReport, QueueError> {
    let mut report = RecoveryReport::default();
    let now = inner.clock.now_millis();

    state.ready.clear();
    state.dedup.clear();
    for task in state.locked.values() {
        if let Some(key) = task.custom_key() {
            let _ = state.dedup.insert(key, task.id);
        }
    }

    for entry in inner.store.scan(LifecycleDir::Pending).await? {
        let task = match entry {
            ScanEntry::Task(task) => task,
            ScanEntry::Corrupt { file_name, reason } => {
                quarantine(inner, LifecycleDir::Pending, &file_name, &reason, now).await?;
                report.quarantined += 1;
                continue;
            }
        };
        inner.ids.observe(task.id);
        if state.locked.contains_key(&task.id) {
            continue;
        }
        index_key(state, &task);
        state.ready.admit(task);
        report.admitted += 1;
    }
    Ok(report)
}

async fn recover_locked(
    inner: &Inner,
    state: &mut QueueState,
    report: &mut RecoveryReport,
) -> Result<(), QueueError> {
    let now = inner.clock.now_millis();
    for entry in inner.store.scan(LifecycleDir::Locked).await? {
        let task = match entry {
            ScanEntry::Task(task) => task,
            ScanEntry::Corrupt { file_name, reason } => {
                quarantine(inner, LifecycleDir::Locked, &file_name, &reason, now).await?;
                report.quarantined += 1;
                continue;
            }
        };
        inner.ids.observe(task.id);
        // Still running in this process (a restart after a slow shutdown).
        if state.locked.contains_key(&task.id) {
            continue;
        }

        warn!(
            task_id = %task.id,
            handler = %task.handler_name,
            try_count = task.try_count,
            "found crash-locked task"
        );
        let error = TaskError::transient(CRASH_RECOVERY_MESSAGE);
        match super::worker::apply_failure(inner, state, task, &error, now).await {
            Ok(LifecycleDir::Failed) => report.failed += 1,
            Ok(_) => report.requeued += 1,
            Err(e) => {
                error!(error = %e, "failed to recover crash-locked task, leaving it in locked/");
            }
        }
    }
    Ok(())
}

/// First task seen for a key owns it; later duplicates are logged.
fn index_key(state: &mut QueueState, task: &TaskRecord) {
    let Some(key) = task.custom_key() else {
        return;
    };
    if let Err(owner) = state.dedup.insert(key, task.id) {
        warn!(
            task_id = %task.id,
            owner = %owner,
            custom_key = key,
            "second live task with the same custom key"
        );
    }
}

async fn quarantine(
    inner: &Inner,
    dir: LifecycleDir,
    file_name: &str,
    reason: &str,
    now: i64,
) -> Result<(), QueueError> {
    let fallback_id = inner.ids.next_task_id();
    match inner
        .store
        .quarantine(dir, file_name, reason, fallback_id, now)
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_missing() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
