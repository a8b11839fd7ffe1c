//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部資源（ファイルシステム、時計、ID 採番）へのインターフェースを
//! 提供し、実装の詳細を隠蔽します。テストでは FixedClock などに差し替える。

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, SequenceIdGenerator};
pub use self::task_store::{ScanEntry, Taken, TaskStore};
