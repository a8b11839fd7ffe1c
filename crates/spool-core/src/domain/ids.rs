//! Domain identifiers (strongly-typed IDs).
//!
//! Task ids are plain 64-bit integers so they stay readable inside file names
//! and inside hand-edited task files. The newtype keeps them from being mixed
//! up with timestamps or counters, which are also `u64`/`i64` in this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a task, unique for the lifetime of a data directory.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Zero is what a hand-written task file carries when it has no identity yet.
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_serializes_as_bare_number() {
        let id = TaskId::new(1001);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "1001");

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn task_id_parses_from_file_name_segment() {
        let id: TaskId = "1421371347569".parse().unwrap();
        assert_eq!(id.as_u64(), 1_421_371_347_569);
        assert!("abc".parse::<TaskId>().is_err());
    }

    #[test]
    fn zero_is_unset() {
        assert!(TaskId::new(0).is_unset());
        assert!(!TaskId::new(7).is_unset());
    }
}
