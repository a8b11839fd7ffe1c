//! Worker - 1 回の試行を実行し、結果をディレクトリに反映する
//!
//! claim（pending/ → locked/ の rename）→ handler 実行 → completed/ | pending/ | failed/

use std::any::Any;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::coordinator::{Inner, QueueState};
use crate::domain::{
    Decision, LifecycleDir, QueueError, StoreError, TaskError, TaskId, TaskRecord,
};
use crate::ports::Taken;

/// Outcome of a claim attempt that got hold of the file.
pub(crate) enum Claim {
    /// Now in `locked/`; the record as read back from disk.
    Locked(TaskRecord),

    /// The file on disk is scheduled later than the cached copy said; left in place.
    NotDue(TaskRecord),
}

/// Claim a task by moving its file from `from` into `locked/`.
///
/// The record is read back from the moved file, so edits made on disk since
/// the cache was filled win. With `due_by`, a record whose on-disk
/// `execute_at` is later than that is put back instead. A `Missing` error
/// means someone else claimed or removed the file first.
pub(crate) async fn claim(
    inner: &Inner,
    state: &mut QueueState,
    file_name: &str,
    from: LifecycleDir,
    due_by: Option<i64>,
    now_ms: i64,
) -> Result<Claim, StoreError> {
    let token = inner.ids.lock_token();
    let lock = |task: &mut TaskRecord| {
        if let Some(due_by) = due_by
            && !task.is_due(due_by)
        {
            return false;
        }
        task.mark_locked(token.clone(), now_ms);
        true
    };

    let locked = match inner
        .store
        .take(file_name, from, LifecycleDir::Locked, &lock)
        .await?
    {
        Taken::Moved(locked) => locked,
        Taken::Declined(task) => {
            debug!(task_id = %task.id, execute_at = task.execute_at, "task on disk is not due yet");
            return Ok(Claim::NotDue(task));
        }
    };
    state.locked.insert(locked.id, locked.clone());
    info!(
        task_id = %locked.id,
        handler = %locked.handler_name,
        try_count = locked.try_count,
        "task claimed"
    );
    Ok(Claim::Locked(locked))
}

/// Claim the cached `task` from `pending/` if it is due at `now_ms`.
///
/// Anything short of a claim goes back into the ready queue, except a file
/// that has vanished.
pub(crate) async fn claim_cached(
    inner: &Inner,
    state: &mut QueueState,
    task: TaskRecord,
    now_ms: i64,
) -> Result<Option<TaskRecord>, StoreError> {
    let Some(file_name) = task.file_name.clone() else {
        warn!(task_id = %task.id, "cached task has no file, dropping it");
        return Ok(None);
    };
    match claim(inner, state, &file_name, LifecycleDir::Pending, Some(now_ms), now_ms).await {
        Ok(Claim::Locked(locked)) => Ok(Some(locked)),
        Ok(Claim::NotDue(on_disk)) => {
            state.ready.admit(on_disk);
            Ok(None)
        }
        Err(e) if e.is_missing() => {
            warn!(task_id = %task.id, "task file vanished before claim, skipping");
            Ok(None)
        }
        Err(e) => {
            // The store put the file back into pending/; try again later.
            state.ready.admit(task);
            Err(e)
        }
    }
}

/// Run one claimed task and record its outcome, holding a worker slot throughout.
pub(crate) async fn run_attempt(inner: Arc<Inner>, task: TaskRecord, permit: OwnedSemaphorePermit) {
    let span = info_span!("task", task.id = %task.id, task.handler = %task.handler_name);
    async move {
        let result = execute(&inner, &task).await;
        finish(&inner, task, result).await;
        drop(permit);
    }
    .instrument(span)
    .await
}

/// Synchronous mode: claim and run the earliest task due at `now_ms`.
pub(crate) async fn execute_next(inner: &Arc<Inner>, now_ms: i64) -> Result<bool, QueueError> {
    let Ok(permit) = Arc::clone(&inner.workers).acquire_owned().await else {
        return Ok(false);
    };
    let locked = {
        let mut state = inner.state.lock().await;
        loop {
            let Some(task) = state.ready.pop_next_due(now_ms) else {
                return Ok(false);
            };
            if let Some(locked) = claim_cached(inner, &mut state, task, now_ms).await? {
                break locked;
            }
        }
    };
    run_attempt(Arc::clone(inner), locked, permit).await;
    Ok(true)
}

/// Run one task now, whatever its schedule, from `pending/` or `failed/`.
///
/// A task sitting in `locked/` only runs with `force` (a lock left behind by
/// a dead process, say). A task this process is running right now is never
/// started twice. Returns whether the task ran.
pub(crate) async fn run_task_for_id(
    inner: &Arc<Inner>,
    id: TaskId,
    force: bool,
) -> Result<bool, QueueError> {
    let Ok(permit) = Arc::clone(&inner.workers).acquire_owned().await else {
        return Ok(false);
    };
    let locked = {
        let mut state = inner.state.lock().await;
        if state.locked.contains_key(&id) {
            warn!(task_id = %id, "task is already running in this process");
            return Ok(false);
        }
        let dirs = [LifecycleDir::Pending, LifecycleDir::Failed, LifecycleDir::Locked];
        let Some((dir, file_name)) = inner.store.find(id, &dirs).await? else {
            return Err(QueueError::TaskNotFound(id));
        };
        if dir == LifecycleDir::Locked {
            warn!(task_id = %id, force, "task is already locked");
            if !force {
                return Ok(false);
            }
        }

        let now = inner.clock.now_millis();
        match claim(inner, &mut state, &file_name, dir, None, now).await {
            Ok(Claim::Locked(locked)) => {
                state.ready.remove(id);
                locked
            }
            Ok(Claim::NotDue(_)) => return Ok(false),
            Err(e) if e.is_missing() => {
                warn!(task_id = %id, "unable to lock task, it moved");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
    };
    info!(task_id = %id, force, "running task on demand");
    run_attempt(Arc::clone(inner), locked, permit).await;
    Ok(true)
}

async fn execute(inner: &Inner, task: &TaskRecord) -> Result<(), TaskError> {
    let Some(handler) = inner.registry.get(&task.handler_name) else {
        return Err(TaskError::permanent(format!(
            "no handler registered for '{}'",
            task.handler_name
        )));
    };

    let record = task.clone();
    let mut attempt = tokio::spawn(async move { handler.handle_dyn(&record).await });

    let joined = match inner.config.task_timeout() {
        Some(limit) => match tokio::time::timeout(limit, &mut attempt).await {
            Ok(joined) => joined,
            Err(_) => {
                attempt.abort();
                return Err(TaskError::transient(format!(
                    "timed out after {} ms",
                    limit.as_millis()
                )));
            }
        },
        None => attempt.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::transient(format!(
            "handler panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(TaskError::transient(format!("attempt aborted: {e}"))),
    }
}

async fn finish(inner: &Inner, task: TaskRecord, result: Result<(), TaskError>) {
    let now = inner.clock.now_millis();
    let mut state = inner.state.lock().await;
    state.locked.remove(&task.id);

    match result {
        Ok(()) => {
            let mut done = task;
            done.mark_completed(now);
            match inner
                .store
                .move_to(&mut done, LifecycleDir::Locked, LifecycleDir::Completed)
                .await
            {
                Ok(()) => {
                    state.release_key(&done);
                    info!(task_id = %done.id, handler = %done.handler_name, "task completed");
                }
                Err(e) => {
                    error!(
                        task_id = %done.id,
                        error = %e,
                        "failed to move completed task, leaving it in locked/"
                    );
                }
            }
        }
        Err(err) => {
            let id = task.id;
            if let Err(e) = apply_failure(inner, &mut state, task, &err, now).await {
                error!(
                    task_id = %id,
                    error = %e,
                    "failed to record task failure, leaving it in locked/"
                );
            }
        }
    }
}

/// Count one failed attempt and move the task out of `locked/`.
///
/// Returns the directory the task ended up in.
pub(crate) async fn apply_failure(
    inner: &Inner,
    state: &mut QueueState,
    mut task: TaskRecord,
    err: &TaskError,
    now_ms: i64,
) -> Result<LifecycleDir, StoreError> {
    task.record_failure(err.message(), now_ms);

    match inner.decider.decide(&task, err) {
        Decision::Retry { delay, reason } => {
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            task.schedule_retry(now_ms.saturating_add(delay_ms), now_ms);
            inner
                .store
                .move_to(&mut task, LifecycleDir::Locked, LifecycleDir::Pending)
                .await?;
            warn!(
                task_id = %task.id,
                try_count = task.try_count,
                delay_ms,
                error = %err,
                reason = %reason,
                "task attempt failed, retry scheduled"
            );
            if let Some(key) = task.custom_key()
                && let Err(owner) = state.dedup.insert(key, task.id)
            {
                warn!(task_id = %task.id, owner = %owner, custom_key = key, "custom key taken while task was locked");
            }
            state.ready.admit(task);
            Ok(LifecycleDir::Pending)
        }
        Decision::MarkFailed { reason } => {
            inner
                .store
                .move_to(&mut task, LifecycleDir::Locked, LifecycleDir::Failed)
                .await?;
            state.release_key(&task);
            error!(
                task_id = %task.id,
                handler = %task.handler_name,
                try_count = task.try_count,
                error = %err,
                reason = %reason,
                "task failed"
            );
            Ok(LifecycleDir::Failed)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}
