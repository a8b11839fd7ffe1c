//! DispatchLoop - 期限の来たタスクを claim してワーカーに渡す
//!
//! # フロー（tick ごと）
//! 1. 空きワーカー枠を待たずに取れるだけ取る
//! 2. 枠の数まで ReadyQueue から due なタスクを pop し、locked/ へ rename
//! 3. ロックを外してから、claim できたタスクをそれぞれ spawn
//!
//! 一定間隔で pending/ からキャッシュを作り直す（ディレクトリが正）。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use super::coordinator::Inner;
use super::worker;

pub(crate) async fn run(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(inner.config.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let resync_every = inner.config.resync_interval();
    let mut last_resync = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        if last_resync.elapsed() >= resync_every {
            last_resync = Instant::now();
            let mut state = inner.state.lock().await;
            match super::recovery::reload_pending(&inner, &mut state).await {
                Ok(report) => debug!(admitted = report.admitted, "resynced ready queue from pending/"),
                Err(e) => error!(error = %e, "resync from pending/ failed"),
            }
        }

        let now = inner.clock.now_millis();
        let dispatched = dispatch_due(&inner, now).await;
        if dispatched > 0 {
            debug!(dispatched, "dispatch tick");
        } else {
            trace!("nothing due");
        }
    }
    info!("dispatch loop stopped");
}

/// Claim as many due tasks as there are free worker slots and spawn them.
pub(crate) async fn dispatch_due(inner: &Arc<Inner>, now_ms: i64) -> usize {
    let mut claimed = Vec::new();
    {
        let mut state = inner.state.lock().await;
        while let Ok(permit) = Arc::clone(&inner.workers).try_acquire_owned() {
            let Some(task) = state.ready.pop_next_due(now_ms) else {
                break;
            };
            let id = task.id;
            match worker::claim_cached(inner, &mut state, task, now_ms).await {
                Ok(Some(locked)) => claimed.push((locked, permit)),
                Ok(None) => {}
                Err(e) => {
                    // Still in pending/ on disk; try again next tick.
                    error!(task_id = %id, error = %e, "failed to claim task");
                    break;
                }
            }
        }
    }

    let count = claimed.len();
    for (task, permit) in claimed {
        tokio::spawn(worker::run_attempt(Arc::clone(inner), task, permit));
    }
    count
}
