//! Task record: the persisted unit of work and its metadata.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Metadata + opaque payload for one task.
///
/// Design:
/// - One record is one file; the directory it sits in is its lifecycle state.
/// - `data_json` belongs to the handler. The queue stores it and hands it back.
/// - All timestamps are epoch milliseconds, zero meaning "never".
/// - Keys are camelCase so hand-edited files dropped into `manualRetry/` read
///   naturally; unknown keys are ignored and `null` strings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRecord {
    pub id: TaskId,

    /// Registry key of the handler that processes this task.
    pub handler_name: String,

    /// Serialized handler state.
    pub data_json: String,

    /// Dedup key; at most one live task may hold a given key.
    pub custom_key: Option<String>,

    /// Earliest time the task may run.
    pub execute_at: i64,

    /// `execute_at` as first enqueued, kept across retries.
    pub originally_scheduled_for: i64,

    pub created_at: i64,
    pub updated_at: i64,
    pub locked_at: i64,
    pub completed_at: i64,

    /// Set whenever an attempt fails, retried or not.
    pub failed_at: i64,

    /// Number of failed attempts so far.
    pub try_count: u32,

    pub never_retry: bool,

    /// Token minted by the claim that locked this task.
    pub lock_uuid: Option<String>,

    pub error_message: Option<String>,

    /// Soft-delete marker for terminal tasks awaiting purge.
    pub deleted: bool,

    /// True until the record has been written for the first time.
    #[serde(skip)]
    pub is_new_insert: bool,

    /// Name of the file backing this record, once it has one.
    #[serde(skip)]
    pub file_name: Option<String>,
}

impl TaskRecord {
    /// Create a fresh record. An `execute_at` of zero means "run as soon as possible".
    pub fn new(
        id: TaskId,
        handler_name: impl Into<String>,
        data_json: impl Into<String>,
        custom_key: Option<String>,
        execute_at: i64,
        now_ms: i64,
    ) -> Self {
        let execute_at = if execute_at > 0 { execute_at } else { now_ms };
        Self {
            id,
            handler_name: handler_name.into(),
            data_json: data_json.into(),
            custom_key: custom_key.filter(|k| !k.is_empty()),
            execute_at,
            originally_scheduled_for: execute_at,
            created_at: now_ms,
            updated_at: now_ms,
            is_new_insert: true,
            ..Self::default()
        }
    }

    /// The dedup key, treating an empty string the same as no key.
    pub fn custom_key(&self) -> Option<&str> {
        self.custom_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.execute_at <= now_ms
    }

    pub fn mark_locked(&mut self, lock_uuid: String, now_ms: i64) {
        self.locked_at = now_ms;
        self.lock_uuid = Some(lock_uuid);
        self.updated_at = now_ms;
    }

    pub fn mark_completed(&mut self, now_ms: i64) {
        self.completed_at = now_ms;
        self.updated_at = now_ms;
    }

    /// Record one failed attempt.
    pub fn record_failure(&mut self, error: &str, now_ms: i64) {
        self.try_count += 1;
        self.failed_at = now_ms;
        self.error_message = Some(error.to_string());
        self.updated_at = now_ms;
    }

    /// Release the lock and push eligibility out to `execute_at`.
    pub fn schedule_retry(&mut self, execute_at: i64, now_ms: i64) {
        self.execute_at = execute_at;
        self.locked_at = 0;
        self.lock_uuid = None;
        self.updated_at = now_ms;
    }

    /// Clear every trace of earlier runs so an operator-supplied record runs again.
    pub fn reset_for_manual_retry(&mut self, now_ms: i64) {
        self.lock_uuid = None;
        self.try_count = 0;
        self.locked_at = 0;
        self.failed_at = 0;
        self.completed_at = 0;
        self.error_message = None;
        self.deleted = false;
        self.updated_at = now_ms;
        if self.created_at == 0 {
            self.created_at = now_ms;
        }
    }

    /// Short, file-name-safe form of the handler name.
    pub fn handler_short_name(&self) -> String {
        let short: String = self
            .handler_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(48)
            .collect();
        if short.is_empty() {
            "task".to_string()
        } else {
            short
        }
    }
}

/// `{YYYYMMDD}-{HHMMSSmmm}-{handlerShort}-{id}-{random}.json`
///
/// Sorts by creation time, stays unique through the id and the random suffix.
pub fn file_name_for(record: &TaskRecord, random: u32) -> String {
    let created = Utc
        .timestamp_millis_opt(record.created_at)
        .single()
        .unwrap_or_default();
    format!(
        "{}-{}-{}-{}.json",
        created.format("%Y%m%d-%H%M%S%3f"),
        record.handler_short_name(),
        record.id,
        random
    )
}

/// Extract the task id from a well-formed task file name.
///
/// Anything else (editor backups, our own `.tmp` files, stray notes) yields `None`.
pub fn task_id_from_file_name(name: &str) -> Option<TaskId> {
    if !name.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let stem = name.strip_suffix(".json")?;
    let mut parts = stem.rsplitn(3, '-');
    let random = parts.next()?;
    let id = parts.next()?;
    parts.next()?;
    if random.is_empty() || !random.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn new_record_defaults_execute_at_to_now() {
        let t = TaskRecord::new(TaskId::new(1), "demo.send.v1", "{}", None, 0, 5_000);
        assert_eq!(t.execute_at, 5_000);
        assert_eq!(t.originally_scheduled_for, 5_000);
        assert_eq!(t.try_count, 0);
        assert!(t.is_new_insert);
        assert!(t.is_due(5_000));
    }

    #[test]
    fn empty_custom_key_means_no_key() {
        let t = TaskRecord::new(TaskId::new(1), "h", "{}", Some(String::new()), 0, 1);
        assert_eq!(t.custom_key(), None);

        let t = TaskRecord::new(TaskId::new(1), "h", "{}", Some("k".into()), 0, 1);
        assert_eq!(t.custom_key(), Some("k"));
    }

    #[test]
    fn failure_then_retry_releases_the_lock() {
        let mut t = TaskRecord::new(TaskId::new(1), "h", "{}", None, 100, 100);
        t.mark_locked("lock-1".into(), 150);
        t.record_failure("boom", 200);
        t.schedule_retry(1_200, 200);

        assert_eq!(t.try_count, 1);
        assert_eq!(t.failed_at, 200);
        assert_eq!(t.locked_at, 0);
        assert_eq!(t.lock_uuid, None);
        assert_eq!(t.execute_at, 1_200);
        assert_eq!(t.originally_scheduled_for, 100);
        assert_eq!(t.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn reads_hand_written_task_file() {
        let json = r#"{
            "deleted" : false,
            "isNewInsert" : false,
            "createdAt" : 0,
            "updatedAt" : 0,
            "handlerName" : "example.task.v1",
            "customKey" : "",
            "lockedAt" : 1421371349577,
            "failedAt" : 1421371349577,
            "completedAt" : 0,
            "originallyScheduledFor" : 0,
            "executeAt" : 1921371332731,
            "neverRetry" : false,
            "lockUuid" : null,
            "secret" : null,
            "tryCount" : 5,
            "errorMessage" : null,
            "dataJson" : "{\"myKey\":\"myVal\",\"taskNumber\":0}",
            "id" : 1001
        }"#;
        let mut t: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(t.id, TaskId::new(1001));
        assert_eq!(t.try_count, 5);
        assert_eq!(t.custom_key(), None);
        assert!(!t.is_new_insert);

        t.reset_for_manual_retry(42);
        assert_eq!(t.try_count, 0);
        assert_eq!(t.locked_at, 0);
        assert_eq!(t.failed_at, 0);
        assert_eq!(t.created_at, 42);
    }

    #[test]
    fn serialized_keys_are_camel_case() {
        let t = TaskRecord::new(TaskId::new(9), "h", "{}", Some("k".into()), 0, 1);
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["handlerName"], "h");
        assert_eq!(v["customKey"], "k");
        assert_eq!(v["originallyScheduledFor"], 1);
        assert!(v.get("isNewInsert").is_none());
        assert!(v.get("fileName").is_none());
    }

    #[test]
    fn file_name_round_trips_the_id() {
        let t = TaskRecord::new(
            TaskId::new(1_700_000_000_000_123),
            "example.task.v1",
            "{}",
            None,
            0,
            1_700_000_000_000,
        );
        let name = file_name_for(&t, 937_506_272);
        assert!(name.starts_with("20231114-"), "{name}");
        assert!(name.contains("-example_task_v1-"), "{name}");
        assert_eq!(task_id_from_file_name(&name), Some(t.id));
    }

    #[rstest]
    #[case("2015-01-16-0122-1273-ExampleTaskHandler-1421371347569-937506272.json", Some(1_421_371_347_569))]
    #[case("20240101-120000000-h-17-5.json", Some(17))]
    #[case(".20240101-120000000-h-17-5.json.tmp", None)]
    #[case("~20240101-120000000-h-17-5.json", None)]
    #[case("20240101-120000000-h-17-5.json~", None)]
    #[case("notes.json", None)]
    #[case("20240101-h-abc-5.json", None)]
    #[case("20240101-h-17-x.json", None)]
    fn recognizes_well_formed_names(#[case] name: &str, #[case] expected: Option<u64>) {
        assert_eq!(task_id_from_file_name(name), expected.map(TaskId::new));
    }
}
