//! IdGenerator port - ID 生成の抽象化
//!
//! TaskId はファイル名にも手書きの task ファイルにも現れるので、ULID ではなく
//! 単調増加の u64 を使う。ロックトークン（lock_uuid）だけは ULID。
//!
//! # 実装
//! - **SequenceIdGenerator**: ミリ秒時刻 × 1000 を下限にした単調カウンタ

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ulid::Ulid;

use crate::domain::TaskId;
use crate::ports::Clock;

/// IdGenerator は TaskId とロックトークンを生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（dispatch loop と enqueue の両方から使う）
pub trait IdGenerator: Send + Sync {
    /// 未使用の TaskId を生成
    fn next_task_id(&self) -> TaskId;

    /// ディスク上で見つかった ID を通知（以後それより大きい ID だけを発行する）
    fn observe(&self, id: TaskId);

    /// claim ごとに発行するロックトークン
    fn lock_token(&self) -> String;
}

/// SequenceIdGenerator は `max(last + 1, now_ms * 1000)` を発行
///
/// 再起動をまたいでも、時計が巻き戻らない限り過去の ID と衝突しない。
/// 時計が巻き戻っても observe() 済みの ID より大きい値を返す。
pub struct SequenceIdGenerator {
    clock: Arc<dyn Clock>,
    last: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn next_task_id(&self) -> TaskId {
        let floor = u64::try_from(self.clock.now_millis())
            .unwrap_or(0)
            .saturating_mul(1000);
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = floor.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return TaskId::new(next),
                Err(actual) => current = actual,
            }
        }
    }

    fn observe(&self, id: TaskId) {
        self.last.fetch_max(id.as_u64(), Ordering::SeqCst);
    }

    fn lock_token(&self) -> String {
        let timestamp_ms = u64::try_from(self.clock.now_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random()).to_string()
    }
}
