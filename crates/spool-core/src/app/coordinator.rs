//! Coordinator - 呼び出し側が触る唯一の入口
//!
//! enqueue / upsert / startup / graceful_shutdown と、観測用のクエリをまとめる。
//! メモリ上のキャッシュ（ReadyQueue, DedupIndex, 実行中マップ）は一つの Mutex の下にあり、
//! ディスクへの書き込みはそのロックを保持したまま行う。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::recovery::RecoveryReport;
use super::status::QueueCounts;
use crate::config::QueueConfig;
use crate::domain::{Decider, LifecycleDir, QueueError, TaskId, TaskRecord};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::queue::{DedupIndex, ReadyQueue};
use crate::typed::{PayloadCodec, Task, TypedRegistry};

/// Per-call scheduling options for `enqueue_with` / `upsert`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Dedup key; empty or `None` means no dedup.
    pub custom_key: Option<String>,

    /// Epoch millis; zero means "as soon as possible".
    pub execute_at: i64,

    pub never_retry: bool,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn custom_key(mut self, key: impl Into<String>) -> Self {
        self.custom_key = Some(key.into());
        self
    }

    pub fn execute_at(mut self, execute_at_ms: i64) -> Self {
        self.execute_at = execute_at_ms;
        self
    }

    pub fn never_retry(mut self) -> Self {
        self.never_retry = true;
        self
    }
}

/// Process-local caches over the lifecycle directories.
#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) ready: ReadyQueue,
    pub(crate) dedup: DedupIndex,
    /// Tasks claimed by this process and not yet finished.
    pub(crate) locked: HashMap<TaskId, TaskRecord>,
}

impl QueueState {
    /// Is `id` pending or running as far as this process knows?
    pub(crate) fn live_record(&self, id: TaskId) -> Option<&TaskRecord> {
        self.ready.get(id).or_else(|| self.locked.get(&id))
    }

    pub(crate) fn release_key(&mut self, task: &TaskRecord) {
        if let Some(key) = task.custom_key() {
            self.dedup.remove_if(key, task.id);
        }
    }
}

pub(crate) struct Running {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: QueueConfig,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: TypedRegistry,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) running: Mutex<Option<Running>>,
}

/// Durable task queue over a data directory.
///
/// Cheap to clone; every clone drives the same queue. Build one with
/// [`CoordinatorBuilder`](super::CoordinatorBuilder).
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
}

impl Coordinator {
    pub(crate) fn from_parts(
        config: QueueConfig,
        store: Arc<dyn TaskStore>,
        registry: TypedRegistry,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_count));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry,
                decider,
                clock,
                ids,
                state: Mutex::new(QueueState::default()),
                workers,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.inner.registry
    }

    /// Run `task` as soon as possible, without dedup.
    pub async fn enqueue<T: Task>(&self, task: &T) -> Result<TaskRecord, QueueError> {
        self.enqueue_with(task, EnqueueOptions::default()).await
    }

    /// Enqueue with a custom key and/or a start time.
    ///
    /// If a live task already holds the key, that task is returned and nothing
    /// is written: the first writer wins.
    pub async fn enqueue_with<T: Task>(
        &self,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<TaskRecord, QueueError> {
        let data_json = PayloadCodec::encode(task).map_err(|e| QueueError::Encode(e.to_string()))?;
        self.enqueue_raw(T::TYPE, data_json, options).await
    }

    /// Untyped enqueue, for callers that already hold a handler name and payload.
    pub async fn enqueue_raw(
        &self,
        handler_name: &str,
        data_json: String,
        options: EnqueueOptions,
    ) -> Result<TaskRecord, QueueError> {
        if handler_name.trim().is_empty() {
            return Err(QueueError::BlankHandlerName);
        }
        let mut state = self.inner.state.lock().await;

        if let Some(key) = non_empty(&options.custom_key)
            && let Some(existing) = self.live_task_for_key(&mut state, key).await?
        {
            info!(
                task_id = %existing.id,
                custom_key = key,
                handler = handler_name,
                "custom key already live, returning existing task"
            );
            return Ok(existing);
        }

        self.create_locked(&mut state, handler_name, data_json, options)
            .await
    }

    /// Enqueue, or update the live pending task holding the same custom key.
    ///
    /// The update replaces handler name and payload. The start time is only
    /// replaced when `execute_at > 0`, the task has never failed, and the
    /// time actually differs. A task that is currently running is returned
    /// untouched.
    pub async fn upsert<T: Task>(
        &self,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<TaskRecord, QueueError> {
        let data_json = PayloadCodec::encode(task).map_err(|e| QueueError::Encode(e.to_string()))?;
        let handler_name = T::TYPE;
        let key = non_empty(&options.custom_key).map(str::to_string);
        let mut state = self.inner.state.lock().await;

        let existing = match &key {
            Some(key) => self.live_task_for_key(&mut state, key).await?,
            None => None,
        };
        let (Some(key), Some(existing)) = (key, existing) else {
            return self
                .create_locked(&mut state, handler_name, data_json, options)
                .await;
        };

        let pending = state.ready.contains(existing.id)
            || (!state.locked.contains_key(&existing.id)
                && self
                    .inner
                    .store
                    .find(existing.id, &[LifecycleDir::Pending])
                    .await?
                    .is_some());
        if !pending {
            info!(task_id = %existing.id, custom_key = %key, "task is running, upsert left it unchanged");
            return Ok(existing);
        }

        let now = self.inner.clock.now_millis();
        let mut updated = existing.clone();
        updated.handler_name = handler_name.to_string();
        updated.data_json = data_json;
        if options.execute_at > 0
            && updated.try_count == 0
            && updated.execute_at != options.execute_at
        {
            updated.execute_at = options.execute_at;
            updated.originally_scheduled_for = options.execute_at;
        }
        updated.updated_at = now;

        self.inner
            .store
            .write(&mut updated, LifecycleDir::Pending)
            .await?;
        state.ready.admit(updated.clone());
        info!(
            task_id = %updated.id,
            custom_key = %key,
            execute_at = updated.execute_at,
            "task updated in place"
        );
        Ok(updated)
    }

    /// Start the queue: recover from disk, then start the background loops.
    ///
    /// Calling it on a running coordinator does nothing.
    pub async fn startup(&self) -> Result<RecoveryReport, QueueError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            debug!("startup called on a running coordinator");
            return Ok(RecoveryReport::default());
        }

        let report = super::recovery::recover(&self.inner).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = vec![
            tokio::spawn(super::dispatch_loop::run(
                Arc::clone(&self.inner),
                shutdown_rx.clone(),
            )),
            tokio::spawn(super::manual_retry::run(
                Arc::clone(&self.inner),
                shutdown_rx.clone(),
            )),
        ];
        if self.inner.config.completed_retention().is_some() {
            joins.push(tokio::spawn(super::gc_loop::run(
                Arc::clone(&self.inner),
                shutdown_rx,
            )));
        }
        *running = Some(Running { shutdown_tx, joins });

        info!(
            workers = self.inner.config.worker_count,
            data_dir = %self.inner.config.data_dir.display(),
            "task queue started"
        );
        Ok(report)
    }

    /// Stop claiming new work and wait for running attempts to finish.
    ///
    /// Returns `false` if attempts were still running when the shutdown timeout
    /// ran out. Pending tasks stay on disk for the next startup.
    pub async fn graceful_shutdown(&self) -> bool {
        let Some(running) = self.inner.running.lock().await.take() else {
            return true;
        };

        // ignore send error: the loops may already have exited
        let _ = running.shutdown_tx.send(true);
        for join in running.joins {
            let _ = join.await;
        }

        let permits = u32::try_from(self.inner.config.worker_count).unwrap_or(u32::MAX);
        let timeout = self.inner.config.shutdown_timeout();
        let drained = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.workers).acquire_many_owned(permits),
        )
        .await
        {
            Ok(Ok(all)) => {
                drop(all);
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                let in_flight = self.inner.state.lock().await.locked.len();
                warn!(
                    in_flight,
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown timed out with tasks still running"
                );
                false
            }
        };
        info!(drained, "task queue stopped");
        drained
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Tasks waiting in the ready queue plus tasks currently running.
    pub async fn pending_task_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.ready.len() + state.locked.len()
    }

    /// Is the task pending or running? Checks memory, then `pending/` and `locked/` on disk.
    pub async fn has_task_with_id(&self, id: TaskId) -> Result<bool, QueueError> {
        {
            let state = self.inner.state.lock().await;
            if state.live_record(id).is_some() {
                return Ok(true);
            }
        }
        Ok(self
            .inner
            .store
            .find(id, &LifecycleDir::LIVE)
            .await?
            .is_some())
    }

    /// Does a live task hold `key`?
    pub async fn has_pending_task_with_custom_key(&self, key: &str) -> bool {
        self.inner.state.lock().await.dedup.contains(key)
    }

    /// Has any task with `key` ever existed, live or finished?
    pub async fn has_task_with_custom_key(&self, key: &str) -> Result<bool, QueueError> {
        if self.has_pending_task_with_custom_key(key).await {
            return Ok(true);
        }
        for dir in [LifecycleDir::Completed, LifecycleDir::Failed] {
            let found = self
                .inner
                .store
                .list_all(dir)
                .await?
                .iter()
                .any(|t| t.custom_key() == Some(key));
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop the in-memory ready queue without touching files.
    pub async fn clear_ready_queue(&self) {
        self.inner.state.lock().await.ready.clear();
    }

    /// Rebuild the ready queue and dedup index from `pending/`.
    pub async fn reload_from_disk(&self) -> Result<usize, QueueError> {
        let mut state = self.inner.state.lock().await;
        let outcome = super::recovery::reload_pending(&self.inner, &mut state).await?;
        Ok(outcome.admitted)
    }

    /// Per-directory file counts plus the in-memory view.
    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        super::status::collect(&self.inner).await
    }

    /// Hard-delete finished tasks older than `cutoff_ms`.
    pub async fn purge_completed_before(&self, cutoff_ms: i64) -> Result<usize, QueueError> {
        let purged = self.inner.store.purge_completed_before(cutoff_ms).await?;
        if purged > 0 {
            info!(purged, cutoff_ms, "purged finished tasks");
        }
        Ok(purged)
    }

    /// Ingest one file from `manualRetry/`. Returns the admitted task, if any.
    pub async fn ingest_manual_retry(
        &self,
        file_name: &str,
    ) -> Result<Option<TaskRecord>, QueueError> {
        super::manual_retry::ingest(&self.inner, file_name).await
    }

    /// Run the earliest task due at `now_ms` inline. Returns whether one ran.
    pub async fn execute_next(&self, now_ms: i64) -> Result<bool, QueueError> {
        super::worker::execute_next(&self.inner, now_ms).await
    }

    /// Run the task with `id` inline, ignoring its schedule and a previous failure.
    ///
    /// Looks in `pending/` and `failed/`; with `force`, also takes a task out
    /// of `locked/`. Returns whether it ran.
    pub async fn run_task_for_id(&self, id: TaskId, force: bool) -> Result<bool, QueueError> {
        super::worker::run_task_for_id(&self.inner, id, force).await
    }

    /// The live task that owns `key`, dropping the mapping if it turns out to be stale.
    async fn live_task_for_key(
        &self,
        state: &mut QueueState,
        key: &str,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let Some(id) = state.dedup.get(key) else {
            return Ok(None);
        };
        if let Some(task) = state.live_record(id) {
            return Ok(Some(task.clone()));
        }
        // The ready queue may have been cleared; the directories decide.
        if let Some((dir, name)) = self.inner.store.find(id, &LifecycleDir::LIVE).await? {
            match self.inner.store.read_file(dir, &name).await {
                Ok(task) => return Ok(Some(task)),
                Err(e) if e.is_missing() => {}
                Err(e) => return Err(e.into()),
            }
        }
        warn!(task_id = %id, custom_key = key, "dropping stale dedup entry");
        state.dedup.remove_if(key, id);
        Ok(None)
    }

    async fn create_locked(
        &self,
        state: &mut QueueState,
        handler_name: &str,
        data_json: String,
        options: EnqueueOptions,
    ) -> Result<TaskRecord, QueueError> {
        let now = self.inner.clock.now_millis();
        let mut task = TaskRecord::new(
            self.inner.ids.next_task_id(),
            handler_name,
            data_json,
            options.custom_key,
            options.execute_at,
            now,
        );
        task.never_retry = options.never_retry;

        self.inner
            .store
            .write(&mut task, LifecycleDir::Pending)
            .await?;
        if let Some(key) = task.custom_key() {
            // Nothing else holds the key here: callers checked under this lock.
            let _ = state.dedup.insert(key, task.id);
        }
        state.ready.admit(task.clone());

        info!(
            task_id = %task.id,
            handler = %task.handler_name,
            execute_at = task.execute_at,
            custom_key = task.custom_key().unwrap_or(""),
            "task enqueued"
        );
        Ok(task)
    }
}

fn non_empty(key: &Option<String>) -> Option<&str> {
    key.as_deref().filter(|k| !k.is_empty())
}
