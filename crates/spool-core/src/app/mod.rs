//! App - アプリケーション層
//!
//! ports を組み合わせてキューの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: 構築とワイヤリング
//! - **Coordinator**: enqueue / upsert / startup / graceful_shutdown
//! - **dispatch_loop**: due なタスクの claim（pending/ → locked/）
//! - **worker**: handler 実行と結果の反映
//! - **recovery**: 起動時の再構築とクラッシュ時 locked/ の回収
//! - **manual_retry**: manualRetry/ の取り込み
//! - **gc_loop**: 完了タスクの保持期限切れ削除

pub mod builder;
pub mod coordinator;
mod dispatch_loop;
mod gc_loop;
mod manual_retry;
pub mod recovery;
pub mod status;
mod worker;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{Coordinator, EnqueueOptions};
pub use self::recovery::RecoveryReport;
pub use self::status::QueueCounts;
