//! spool-core
//!
//! Durable, file-backed task queue. Every task is one JSON file and the
//! directory it sits in is its state:
//!
//! ```text
//! <data_dir>/async-tasks/{pending,locked,completed,failed,manualRetry}/
//! ```
//!
//! Claiming a task is a rename from `pending/` to `locked/`, so at most one
//! worker ever runs a given task, across restarts too.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（TaskId, TaskRecord, LifecycleDir, errors, decision）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **impls**: 実装（FileTaskStore）
//! - **queue**: メモリ上のインデックス（ReadyQueue, DedupIndex）と RetryPolicy
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, PayloadCodec）
//! - **app**: Coordinator と各ループ（dispatch, recovery, manual retry, gc）
//! - **config**: QueueConfig（TOML）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{BuildError, Coordinator, CoordinatorBuilder, EnqueueOptions, QueueCounts, RecoveryReport};
pub use config::{ConfigError, QueueConfig, RetryConfig};
pub use domain::{ErrorKind, LifecycleDir, QueueError, StoreError, TaskError, TaskId, TaskRecord};
pub use typed::{Handler, Task};
