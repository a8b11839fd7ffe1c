//! ManualRetry - `manualRetry/` に置かれたファイルを pending タスクとして取り込む
//!
//! ファイル監視の代わりに一定間隔でディレクトリを見る。通知が重複しても、
//! 取り込みはロック下で行い、元ファイルは取り込み後に消すので二重登録にならない。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::coordinator::Inner;
use crate::domain::{LifecycleDir, QueueError, StoreError, TaskRecord};

pub(crate) async fn run(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(inner.config.manual_retry_poll());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        let names = match inner.store.list_file_names(LifecycleDir::ManualRetry).await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "failed to list manualRetry/");
                continue;
            }
        };
        for name in names {
            if let Err(e) = ingest(&inner, &name).await {
                error!(file = %name, error = %e, "manual retry ingestion failed");
            }
        }
    }
}

/// Take one file from `manualRetry/` into `pending/`.
///
/// - a file that is already gone is a no-op (duplicate notification)
/// - an unreadable file is quarantined into `failed/`
/// - retry history is cleared; the id is kept unless another task already uses it
/// - if a live task holds the same custom key, that task wins and the file is dropped
pub(crate) async fn ingest(
    inner: &Inner,
    file_name: &str,
) -> Result<Option<TaskRecord>, QueueError> {
    let dir = LifecycleDir::ManualRetry;
    let mut state = inner.state.lock().await;
    let now = inner.clock.now_millis();

    let mut task = match inner.store.read_file(dir, file_name).await {
        Ok(task) => task,
        Err(e) if e.is_missing() => return Ok(None),
        Err(StoreError::Corrupt { reason, .. }) => {
            inner
                .store
                .quarantine(dir, file_name, &reason, inner.ids.next_task_id(), now)
                .await?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if task.handler_name.trim().is_empty() {
        inner
            .store
            .quarantine(
                dir,
                file_name,
                "missing handlerName",
                inner.ids.next_task_id(),
                now,
            )
            .await?;
        return Ok(None);
    }

    if let Some(key) = task.custom_key()
        && let Some(owner) = state.dedup.get(key)
    {
        warn!(
            file = file_name,
            owner = %owner,
            custom_key = key,
            "manual retry dropped: a live task already holds its custom key"
        );
        remove_ingested(inner, file_name).await?;
        return Ok(None);
    }

    let id_taken = task.id.is_unset()
        || state.live_record(task.id).is_some()
        || inner
            .store
            .find(
                task.id,
                &[
                    LifecycleDir::Pending,
                    LifecycleDir::Locked,
                    LifecycleDir::Completed,
                    LifecycleDir::Failed,
                ],
            )
            .await?
            .is_some();
    if id_taken {
        task.id = inner.ids.next_task_id();
    } else {
        inner.ids.observe(task.id);
    }

    task.reset_for_manual_retry(now);
    if task.execute_at <= 0 {
        task.execute_at = now;
    }
    task.file_name = None;
    inner.store.write(&mut task, LifecycleDir::Pending).await?;
    if let Err(e) = remove_ingested(inner, file_name).await {
        // Undo, so the next poll does not take the same file in twice.
        let _ = inner.store.delete(&task, LifecycleDir::Pending).await;
        return Err(e);
    }

    if let Some(key) = task.custom_key() {
        let _ = state.dedup.insert(key, task.id);
    }
    state.ready.admit(task.clone());
    info!(
        task_id = %task.id,
        handler = %task.handler_name,
        file = file_name,
        "manual retry ingested"
    );
    Ok(Some(task))
}

async fn remove_ingested(inner: &Inner, file_name: &str) -> Result<(), QueueError> {
    match inner
        .store
        .remove_file(LifecycleDir::ManualRetry, file_name)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_missing() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
