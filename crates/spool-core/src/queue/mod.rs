//! Queue module: in-memory indexes over the on-disk store, plus retry timing.
//!
//! Both indexes are caches. The lifecycle directories are the source of truth
//! and recovery rebuilds these from them.

mod dedup;
mod ready;
mod retry;

pub use dedup::DedupIndex;
pub use ready::ReadyQueue;
pub use retry::RetryPolicy;
