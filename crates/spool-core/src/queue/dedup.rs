//! Dedup index: custom key -> id of the live task holding it.

use std::collections::HashMap;

use crate::domain::TaskId;

/// Maps each custom key to the one live task that owns it.
///
/// First writer wins; an entry is released only by the task that holds it.
#[derive(Debug, Default)]
pub struct DedupIndex {
    keys: HashMap<String, TaskId>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<TaskId> {
        self.keys.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Claim `key` for `id`. Returns the current owner if the key is already taken.
    pub fn insert(&mut self, key: &str, id: TaskId) -> Result<(), TaskId> {
        match self.keys.get(key) {
            Some(&owner) if owner != id => Err(owner),
            _ => {
                self.keys.insert(key.to_string(), id);
                Ok(())
            }
        }
    }

    /// Release `key`, but only if `id` still owns it.
    pub fn remove_if(&mut self, key: &str, id: TaskId) -> bool {
        if self.keys.get(key) == Some(&id) {
            self.keys.remove(key);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let mut idx = DedupIndex::new();
        assert!(idx.insert("k", TaskId::new(1)).is_ok());
        assert_eq!(idx.insert("k", TaskId::new(2)), Err(TaskId::new(1)));
        assert!(idx.insert("k", TaskId::new(1)).is_ok());
        assert_eq!(idx.get("k"), Some(TaskId::new(1)));
    }

    #[test]
    fn only_the_owner_releases_a_key() {
        let mut idx = DedupIndex::new();
        idx.insert("k", TaskId::new(1)).unwrap();

        assert!(!idx.remove_if("k", TaskId::new(2)));
        assert!(idx.contains("k"));
        assert!(idx.remove_if("k", TaskId::new(1)));
        assert!(idx.is_empty());
    }
}
