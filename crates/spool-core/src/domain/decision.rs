//! Decision model: what happens to a task after a failed attempt.
//!
//! The Decision type says what to do next; the Decider trait picks it from
//! the task record and the error the attempt produced.

use std::time::Duration;

use super::{TaskError, TaskRecord};
use crate::queue::RetryPolicy;

/// The next action for a task whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Back to `pending/`, eligible again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Into `failed/` for good (until an operator retries it by hand).
    MarkFailed { reason: String },
}

/// Picks the next action after a failure.
///
/// Deciders are pure: the record passed in already has `try_count` bumped for
/// the attempt that just failed, and the caller applies whatever comes back.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, error: &TaskError) -> Decision;
}

/// Attempt-budget decider with exponential backoff.
///
/// - `never_retry` tasks and permanent errors fail immediately
/// - otherwise retry until `try_count` reaches `max_attempts`
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, error: &TaskError) -> Decision {
        if task.never_retry {
            return Decision::MarkFailed {
                reason: format!("never_retry set: {error}"),
            };
        }
        if error.is_permanent() {
            return Decision::MarkFailed {
                reason: format!("permanent error: {error}"),
            };
        }
        let max_attempts = self.retry_policy.max_attempts;
        if task.try_count >= max_attempts {
            return Decision::MarkFailed {
                reason: format!("max attempts reached: {}/{}", task.try_count, max_attempts),
            };
        }
        let delay = self.retry_policy.next_delay(task.try_count);
        Decision::Retry {
            delay,
            reason: format!(
                "retry {}/{} after {:?}",
                task.try_count + 1,
                max_attempts,
                delay
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use rstest::rstest;

    fn failed_task(try_count: u32) -> TaskRecord {
        let mut t = TaskRecord::new(TaskId::new(1), "h", "{}", None, 0, 0);
        t.try_count = try_count;
        t
    }

    fn decider() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        })
    }

    #[rstest]
    #[case(1, Some(Duration::from_secs(1)))]
    #[case(2, Some(Duration::from_secs(2)))]
    #[case(3, None)]
    #[case(99, None)]
    fn transient_errors_retry_until_budget(
        #[case] try_count: u32,
        #[case] expected_delay: Option<Duration>,
    ) {
        let d = decider().decide(&failed_task(try_count), &TaskError::transient("flaky"));
        match (d, expected_delay) {
            (Decision::Retry { delay, .. }, Some(expected)) => assert_eq!(delay, expected),
            (Decision::MarkFailed { .. }, None) => {}
            (other, _) => panic!("unexpected decision for try_count={try_count}: {other:?}"),
        }
    }

    #[test]
    fn permanent_errors_fail_on_first_attempt() {
        let d = decider().decide(&failed_task(1), &TaskError::permanent("no handler"));
        assert!(matches!(d, Decision::MarkFailed { reason } if reason.contains("no handler")));
    }

    #[test]
    fn never_retry_fails_on_first_attempt() {
        let mut t = failed_task(1);
        t.never_retry = true;
        let d = decider().decide(&t, &TaskError::transient("flaky"));
        assert!(matches!(d, Decision::MarkFailed { .. }));
    }
}
