//! FileTaskStore - ローカルディスク上の TaskStore 実装
//!
//! レイアウト:
//! ```text
//! <data_dir>/async-tasks/
//!     pending/  locked/  completed/  failed/  manualRetry/
//! ```
//!
//! すべての書き込みは `.{name}.tmp` に書いて fsync し、rename で置き換える。
//! 一時ファイルは scan の対象外で、起動時に掃除される。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::domain::{
    LifecycleDir, StoreError, TaskId, TaskRecord, file_name_for, task_id_from_file_name,
};
use crate::ports::{ScanEntry, Taken, TaskStore};

const ROOT_DIR_NAME: &str = "async-tasks";

pub struct FileTaskStore {
    root: PathBuf,
}

impl FileTaskStore {
    /// `data_dir` の下に `async-tasks/` を置く
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join(ROOT_DIR_NAME),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_path(&self, dir: LifecycleDir) -> PathBuf {
        self.root.join(dir.dir_name())
    }

    pub fn file_path(&self, dir: LifecycleDir, file_name: &str) -> PathBuf {
        self.dir_path(dir).join(file_name)
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = temp_path_for(path);
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::io(path, e));
        }
        Ok(())
    }

    async fn read_entry(&self, dir: LifecycleDir, file_name: &str) -> Result<ScanEntry, StoreError> {
        match self.read_file(dir, file_name).await {
            Ok(task) => Ok(ScanEntry::Task(task)),
            Err(StoreError::Corrupt { reason, .. }) => Ok(ScanEntry::Corrupt {
                file_name: file_name.to_string(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    async fn sweep_temp_files(&self, dir: LifecycleDir) -> Result<(), StoreError> {
        let path = self.dir_path(dir);
        let mut entries = fs::read_dir(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&path, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(".tmp") {
                debug!(dir = %dir, file = %name, "removing leftover temp file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    /// Put a file back where it was after a failed transition.
    async fn undo_rename(&self, moved: &Path, original: &Path) {
        if let Err(e) = fs::rename(moved, original).await {
            error!(
                from = %moved.display(),
                to = %original.display(),
                error = %e,
                "could not move task file back after a failed transition"
            );
        }
    }

    async fn rewrite_taken(
        &self,
        dir: LifecycleDir,
        file_name: &str,
        update: &(dyn for<'u> Fn(&'u mut TaskRecord) -> bool + Send + Sync),
    ) -> Result<(TaskRecord, bool), StoreError> {
        let mut task = self.read_file(dir, file_name).await?;
        if !update(&mut task) {
            return Ok((task, false));
        }
        let bytes = serde_json::to_vec_pretty(&task)?;
        self.write_atomic(&self.file_path(dir, file_name), &bytes)
            .await?;
        Ok((task, true))
    }
}

/// Is `name` something this store should treat as a task file?
///
/// Operators name files in `manualRetry/` however they like, so there any
/// visible `.json` file counts. Everywhere else the name must carry the id.
pub fn is_task_file(dir: LifecycleDir, name: &str) -> bool {
    if dir == LifecycleDir::ManualRetry {
        return name.ends_with(".json") && !name.starts_with(['.', '~', '#']);
    }
    task_id_from_file_name(name).is_some()
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in LifecycleDir::ALL {
            let path = self.dir_path(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            self.sweep_temp_files(dir).await?;
        }
        Ok(())
    }

    async fn write(&self, task: &mut TaskRecord, dir: LifecycleDir) -> Result<(), StoreError> {
        let file_name = match &task.file_name {
            Some(name) => name.clone(),
            None => {
                let name = file_name_for(task, rand::random());
                task.file_name = Some(name.clone());
                name
            }
        };
        let bytes = serde_json::to_vec_pretty(task)?;
        self.write_atomic(&self.file_path(dir, &file_name), &bytes)
            .await?;
        task.is_new_insert = false;
        debug!(task_id = %task.id, dir = %dir, file = %file_name, "task written");
        Ok(())
    }

    async fn move_to(
        &self,
        task: &mut TaskRecord,
        from: LifecycleDir,
        to: LifecycleDir,
    ) -> Result<(), StoreError> {
        let Some(file_name) = task.file_name.clone() else {
            return Err(StoreError::Missing {
                path: self.dir_path(from),
            });
        };
        let src = self.file_path(from, &file_name);
        let dst = self.file_path(to, &file_name);
        let bytes = serde_json::to_vec_pretty(task)?;

        // The rename is the transition. Whoever loses the race sees Missing.
        fs::rename(&src, &dst)
            .await
            .map_err(|e| StoreError::io(&src, e))?;

        if let Err(e) = self.write_atomic(&dst, &bytes).await {
            self.undo_rename(&dst, &src).await;
            return Err(e);
        }
        debug!(task_id = %task.id, from = %from, to = %to, "task moved");
        Ok(())
    }

    async fn take(
        &self,
        file_name: &str,
        from: LifecycleDir,
        to: LifecycleDir,
        update: &(dyn for<'u> Fn(&'u mut TaskRecord) -> bool + Send + Sync),
    ) -> Result<Taken, StoreError> {
        let src = self.file_path(from, file_name);
        let dst = self.file_path(to, file_name);
        fs::rename(&src, &dst)
            .await
            .map_err(|e| StoreError::io(&src, e))?;

        match self.rewrite_taken(to, file_name, update).await {
            Ok((task, true)) => {
                debug!(task_id = %task.id, from = %from, to = %to, "task taken");
                Ok(Taken::Moved(task))
            }
            Ok((task, false)) => {
                self.undo_rename(&dst, &src).await;
                Ok(Taken::Declined(task))
            }
            Err(e) => {
                self.undo_rename(&dst, &src).await;
                Err(e)
            }
        }
    }

    async fn scan(&self, dir: LifecycleDir) -> Result<Vec<ScanEntry>, StoreError> {
        let mut out = Vec::new();
        for name in self.list_file_names(dir).await? {
            match self.read_entry(dir, &name).await {
                Ok(entry) => out.push(entry),
                // Moved away between listing and reading.
                Err(e) if e.is_missing() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn list_file_names(&self, dir: LifecycleDir) -> Result<Vec<String>, StoreError> {
        let path = self.dir_path(dir);
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&path, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_task_file(dir, &name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_file(
        &self,
        dir: LifecycleDir,
        file_name: &str,
    ) -> Result<TaskRecord, StoreError> {
        let path = self.file_path(dir, file_name);
        let bytes = fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
        let mut task: TaskRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if dir != LifecycleDir::ManualRetry
            && let Some(id) = task_id_from_file_name(file_name)
            && id != task.id
        {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("file name says id {id}, record says {}", task.id),
            });
        }
        task.is_new_insert = false;
        task.file_name = Some(file_name.to_string());
        Ok(task)
    }

    async fn remove_file(&self, dir: LifecycleDir, file_name: &str) -> Result<(), StoreError> {
        let path = self.file_path(dir, file_name);
        fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    async fn find(
        &self,
        id: TaskId,
        dirs: &[LifecycleDir],
    ) -> Result<Option<(LifecycleDir, String)>, StoreError> {
        for &dir in dirs {
            let hit = self
                .list_file_names(dir)
                .await?
                .into_iter()
                .find(|name| task_id_from_file_name(name) == Some(id));
            if let Some(name) = hit {
                return Ok(Some((dir, name)));
            }
        }
        Ok(None)
    }

    async fn quarantine(
        &self,
        dir: LifecycleDir,
        file_name: &str,
        reason: &str,
        fallback_id: TaskId,
        now_ms: i64,
    ) -> Result<TaskRecord, StoreError> {
        let src = self.file_path(dir, file_name);
        let raw = fs::read(&src).await.map_err(|e| StoreError::io(&src, e))?;

        let id = task_id_from_file_name(file_name).unwrap_or(fallback_id);
        let mut task = TaskRecord::new(id, "", String::from_utf8_lossy(&raw), None, now_ms, now_ms);
        task.never_retry = true;
        task.record_failure(&format!("corrupt record: {reason}"), now_ms);
        if task_id_from_file_name(file_name).is_some() {
            task.file_name = Some(file_name.to_string());
        }

        self.write(&mut task, LifecycleDir::Failed).await?;
        match fs::remove_file(&src).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&src, e)),
        }
        warn!(dir = %dir, file = %file_name, reason, "quarantined corrupt task file");
        Ok(task)
    }

    async fn count(&self, dir: LifecycleDir) -> Result<usize, StoreError> {
        Ok(self.list_file_names(dir).await?.len())
    }

    async fn purge_completed_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut purged = 0;
        for dir in [LifecycleDir::Completed, LifecycleDir::Failed] {
            for task in self.list_all(dir).await? {
                if dir == LifecycleDir::Failed && !task.deleted {
                    continue;
                }
                let finished_at = [task.completed_at, task.failed_at, task.updated_at]
                    .into_iter()
                    .max()
                    .unwrap_or_default();
                if finished_at >= cutoff_ms {
                    continue;
                }
                match self.delete(&task, dir).await {
                    Ok(()) => purged += 1,
                    Err(e) if e.is_missing() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileTaskStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(tmp.path());
        store.ensure_layout().await.unwrap();
        (tmp, store)
    }

    fn task(id: u64) -> TaskRecord {
        TaskRecord::new(TaskId::new(id), "demo.task.v1", r#"{"n":1}"#, None, 0, 1_000)
    }

    #[tokio::test]
    async fn layout_has_every_lifecycle_dir() {
        let (tmp, _store) = store().await;
        for dir in LifecycleDir::ALL {
            assert!(tmp.path().join("async-tasks").join(dir.dir_name()).is_dir());
        }
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let (_tmp, store) = store().await;
        let mut t = task(7);
        store.write(&mut t, LifecycleDir::Pending).await.unwrap();
        assert!(!t.is_new_insert);

        let name = t.file_name.clone().unwrap();
        let back = store.read_file(LifecycleDir::Pending, &name).await.unwrap();
        assert_eq!(back.id, t.id);
        assert_eq!(back.data_json, t.data_json);
        assert_eq!(store.count(LifecycleDir::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_move_of_the_same_file_sees_missing() {
        let (_tmp, store) = store().await;
        let mut t = task(7);
        store.write(&mut t, LifecycleDir::Pending).await.unwrap();

        let mut a = t.clone();
        let mut b = t.clone();
        store
            .move_to(&mut a, LifecycleDir::Pending, LifecycleDir::Locked)
            .await
            .unwrap();
        let err = store
            .move_to(&mut b, LifecycleDir::Pending, LifecycleDir::Locked)
            .await
            .unwrap_err();
        assert!(err.is_missing());
        assert_eq!(store.count(LifecycleDir::Pending).await.unwrap(), 0);
        assert_eq!(store.count(LifecycleDir::Locked).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_rewrite_puts_the_file_back() {
        let (_tmp, store) = store().await;
        let mut t = task(7);
        store.write(&mut t, LifecycleDir::Pending).await.unwrap();
        let name = t.file_name.clone().unwrap();
        // A directory where the temp file would go makes the rewrite fail.
        let blocker = store.file_path(LifecycleDir::Locked, &format!(".{name}.tmp"));
        std::fs::create_dir(&blocker).unwrap();

        let mut moving = t.clone();
        moving.mark_locked("lock".to_string(), 2_000);
        assert!(store
            .move_to(&mut moving, LifecycleDir::Pending, LifecycleDir::Locked)
            .await
            .is_err());
        let lock_all = |_: &mut TaskRecord| true;
        assert!(store
            .take(&name, LifecycleDir::Pending, LifecycleDir::Locked, &lock_all)
            .await
            .is_err());

        assert_eq!(
            store.list_file_names(LifecycleDir::Pending).await.unwrap(),
            vec![name.clone()]
        );
        assert_eq!(store.count(LifecycleDir::Locked).await.unwrap(), 0);
        let back = store.read_file(LifecycleDir::Pending, &name).await.unwrap();
        assert!(back.lock_uuid.is_none());
    }

    #[tokio::test]
    async fn take_updates_the_record_found_on_disk() {
        let (_tmp, store) = store().await;
        let mut cached = task(7);
        store.write(&mut cached, LifecycleDir::Pending).await.unwrap();
        let name = cached.file_name.clone().unwrap();

        let mut edited = cached.clone();
        edited.data_json = r#"{"n":2}"#.to_string();
        store.write(&mut edited, LifecycleDir::Pending).await.unwrap();

        let lock = |t: &mut TaskRecord| {
            t.mark_locked("lock".to_string(), 2_000);
            true
        };
        let taken = store
            .take(&name, LifecycleDir::Pending, LifecycleDir::Locked, &lock)
            .await
            .unwrap();
        let Taken::Moved(locked) = taken else {
            panic!("expected the file to move");
        };
        assert_eq!(locked.data_json, r#"{"n":2}"#);
        assert_eq!(locked.lock_uuid.as_deref(), Some("lock"));

        let on_disk = store.read_file(LifecycleDir::Locked, &name).await.unwrap();
        assert_eq!(on_disk.data_json, r#"{"n":2}"#);
        assert_eq!(on_disk.locked_at, 2_000);
    }

    #[tokio::test]
    async fn declined_take_leaves_the_file_untouched() {
        let (_tmp, store) = store().await;
        let mut t = task(7);
        store.write(&mut t, LifecycleDir::Pending).await.unwrap();
        let name = t.file_name.clone().unwrap();

        let decline = |_: &mut TaskRecord| false;
        let taken = store
            .take(&name, LifecycleDir::Pending, LifecycleDir::Locked, &decline)
            .await
            .unwrap();

        assert!(matches!(taken, Taken::Declined(ref d) if d.id == t.id));
        assert_eq!(store.count(LifecycleDir::Pending).await.unwrap(), 1);
        assert_eq!(store.count(LifecycleDir::Locked).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn quarantine_without_an_id_in_the_name_uses_the_fallback() {
        let (tmp, store) = store().await;
        std::fs::write(
            tmp.path().join("async-tasks/manualRetry/broken.json"),
            "{oops",
        )
        .unwrap();

        let q = store
            .quarantine(LifecycleDir::ManualRetry, "broken.json", "bad json", TaskId::new(77), 5_000)
            .await
            .unwrap();

        assert_eq!(q.id, TaskId::new(77));
        assert!(store.find(TaskId::new(77), &[LifecycleDir::Failed]).await.unwrap().is_some());
        assert_eq!(store.count(LifecycleDir::ManualRetry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn temp_files_are_ignored_then_swept() {
        let (tmp, store) = store().await;
        let pending = tmp.path().join("async-tasks/pending");
        std::fs::write(pending.join(".20240101-000000000-h-1-1.json.tmp"), "{").unwrap();
        std::fs::write(pending.join("README.txt"), "hi").unwrap();

        assert!(store.scan(LifecycleDir::Pending).await.unwrap().is_empty());
        store.ensure_layout().await.unwrap();
        assert!(!pending.join(".20240101-000000000-h-1-1.json.tmp").exists());
        assert!(pending.join("README.txt").exists());
    }

    #[tokio::test]
    async fn corrupt_files_scan_as_corrupt_and_quarantine_to_failed() {
        let (tmp, store) = store().await;
        let name = "20240101-000000000-h-42-1.json";
        std::fs::write(tmp.path().join("async-tasks/pending").join(name), "{not json").unwrap();

        let entries = store.scan(LifecycleDir::Pending).await.unwrap();
        assert!(matches!(&entries[..], [ScanEntry::Corrupt { file_name, .. }] if file_name == name));

        let q = store
            .quarantine(LifecycleDir::Pending, name, "bad json", TaskId::new(1), 5_000)
            .await
            .unwrap();
        assert_eq!(q.id, TaskId::new(42));
        assert!(q.error_message.unwrap().starts_with("corrupt record"));
        assert_eq!(store.count(LifecycleDir::Pending).await.unwrap(), 0);

        let failed = store.read_file(LifecycleDir::Failed, name).await.unwrap();
        assert_eq!(failed.data_json, "{not json");
    }

    #[tokio::test]
    async fn find_searches_the_given_dirs_only() {
        let (_tmp, store) = store().await;
        let mut t = task(9);
        store.write(&mut t, LifecycleDir::Completed).await.unwrap();

        assert!(store
            .find(t.id, &LifecycleDir::LIVE)
            .await
            .unwrap()
            .is_none());
        let hit = store.find(t.id, &LifecycleDir::ALL).await.unwrap();
        assert_eq!(hit.map(|(dir, _)| dir), Some(LifecycleDir::Completed));
    }

    #[tokio::test]
    async fn purge_removes_old_completed_and_deleted_failed_tasks() {
        let (_tmp, store) = store().await;
        let mut old = task(1);
        old.mark_completed(1_000);
        store.write(&mut old, LifecycleDir::Completed).await.unwrap();
        let mut fresh = task(2);
        fresh.mark_completed(9_000);
        store.write(&mut fresh, LifecycleDir::Completed).await.unwrap();

        let mut kept_failure = task(3);
        kept_failure.record_failure("boom", 1_000);
        store.write(&mut kept_failure, LifecycleDir::Failed).await.unwrap();
        let mut deleted_failure = task(4);
        deleted_failure.record_failure("boom", 1_000);
        deleted_failure.deleted = true;
        store.write(&mut deleted_failure, LifecycleDir::Failed).await.unwrap();

        assert_eq!(store.purge_completed_before(5_000).await.unwrap(), 2);
        let left = store.list_file_names(LifecycleDir::Completed).await.unwrap();
        assert_eq!(left, vec![fresh.file_name.unwrap()]);
        let left = store.list_file_names(LifecycleDir::Failed).await.unwrap();
        assert_eq!(left, vec![kept_failure.file_name.unwrap()]);
    }

    #[test]
    fn manual_retry_accepts_any_visible_json() {
        assert!(is_task_file(LifecycleDir::ManualRetry, "retry-me.json"));
        assert!(!is_task_file(LifecycleDir::ManualRetry, ".retry-me.json"));
        assert!(!is_task_file(LifecycleDir::Pending, "retry-me.json"));
    }
}
