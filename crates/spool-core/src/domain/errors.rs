//! Errors and their operational classification.

use std::path::PathBuf;

use thiserror::Error;

use super::ids::TaskId;

/// ErrorKind classifies a failed attempt.
///
/// - Transient: worth retrying (handler error, panic, timeout)
/// - Permanent: retrying cannot help (unknown handler, undecodable payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// The error a handler returns from one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskError {
    kind: ErrorKind,
    message: String,
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

/// Failures of the on-disk task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was not where the caller expected it; usually someone else moved it first.
    #[error("task file missing: {path}")]
    Missing { path: PathBuf },

    #[error("failed to serialize task record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt task file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return StoreError::Missing { path: path.into() };
        }
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::Missing { .. })
    }
}

/// Errors surfaced to callers of the coordinator.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task was enqueued with a blank handler name")]
    BlankHandlerName,

    #[error("failed to encode task payload: {0}")]
    Encode(String),

    #[error("task not found for id {0}")]
    TaskNotFound(TaskId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_io_errors_become_missing() {
        let err = StoreError::io(
            "/tmp/x.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_missing());

        let err = StoreError::io(
            "/tmp/x.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(!err.is_missing());
        assert!(err.to_string().contains("/tmp/x.json"));
    }

    #[test]
    fn task_error_keeps_kind_and_message() {
        let e = TaskError::permanent("no handler");
        assert!(e.is_permanent());
        assert_eq!(e.to_string(), "no handler");
        assert_eq!(TaskError::transient("flaky").kind(), ErrorKind::Transient);
    }
}
