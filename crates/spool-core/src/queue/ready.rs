//! In-memory ready queue: pending tasks ordered by `execute_at`.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{TaskId, TaskRecord};

/// Pending tasks ordered by `(execute_at, id)`.
///
/// A side index by id lets a task be rescheduled or dropped without a scan,
/// which a heap cannot do.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    by_time: BTreeMap<(i64, TaskId), TaskRecord>,
    index: HashMap<TaskId, i64>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, replacing any entry with the same id.
    pub fn admit(&mut self, task: TaskRecord) {
        self.remove(task.id);
        self.index.insert(task.id, task.execute_at);
        self.by_time.insert((task.execute_at, task.id), task);
    }

    /// Remove and return every task due at `now_ms`, earliest first.
    pub fn pop_due(&mut self, now_ms: i64) -> Vec<TaskRecord> {
        let mut due = Vec::new();
        while let Some(task) = self.pop_next_due(now_ms) {
            due.push(task);
        }
        due
    }

    /// Remove and return the earliest task due at `now_ms`, if any.
    pub fn pop_next_due(&mut self, now_ms: i64) -> Option<TaskRecord> {
        let (&(execute_at, _), _) = self.by_time.first_key_value()?;
        if execute_at > now_ms {
            return None;
        }
        let (_, task) = self.by_time.pop_first()?;
        self.index.remove(&task.id);
        Some(task)
    }

    /// When the earliest task becomes due.
    pub fn next_due_at(&self) -> Option<i64> {
        self.by_time.first_key_value().map(|(&(at, _), _)| at)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<TaskRecord> {
        let execute_at = self.index.remove(&id)?;
        self.by_time.remove(&(execute_at, id))
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        let execute_at = self.index.get(&id)?;
        self.by_time.get(&(*execute_at, id))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_time.clear();
        self.index.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.by_time.keys().map(|&(_, id)| id)
    }
}
