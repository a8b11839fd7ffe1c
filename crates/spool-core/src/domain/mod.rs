//! Domain model (ids, task records, lifecycle dirs, errors, decisions).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, QueueError, StoreError, TaskError};
pub use ids::TaskId;
pub use state::LifecycleDir;
pub use task::{TaskRecord, file_name_for, task_id_from_file_name};
