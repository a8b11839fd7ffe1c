//! GCLoop - 保持期限を過ぎた完了タスクの削除
//!
//! # フロー
//! 1. `cleanup_interval_secs` ごとに起きる
//! 2. cutoff = now - `completed_retention_days`
//! 3. completed/ と deleted 付きの failed/ から cutoff より古いものを消す

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::coordinator::Inner;

pub(crate) async fn run(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let Some(retention) = inner.config.completed_retention() else {
        return;
    };
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);

    let mut tick = tokio::time::interval(inner.config.cleanup_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        let cutoff = inner.clock.now_millis().saturating_sub(retention_ms);
        match inner.store.purge_completed_before(cutoff).await {
            Ok(purged) => debug!(purged, cutoff, "cleanup pass finished"),
            Err(e) => error!(error = %e, "cleanup pass failed"),
        }
    }
}
