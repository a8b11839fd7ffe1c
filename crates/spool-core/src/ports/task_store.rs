//! TaskStore port - ライフサイクルディレクトリが正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - 1 タスク = 1 ファイル、ディレクトリ = 状態
//! - ディレクトリ間の移動（rename）が状態遷移そのもの
//! - 壊れたファイルの隔離（failed/ へ）
//!
//! メモリ上の ReadyQueue / DedupIndex はすべてここから再構築できる。

use async_trait::async_trait;

use crate::domain::{LifecycleDir, StoreError, TaskId, TaskRecord};

/// 1 ファイルを読んだ結果
#[derive(Debug)]
pub enum ScanEntry {
    Task(TaskRecord),
    Corrupt { file_name: String, reason: String },
}

/// `take` の結果
#[derive(Debug)]
pub enum Taken {
    /// 移動先に書き直した、ディスク上の最新の record
    Moved(TaskRecord),
    /// `update` が断ったので元のディレクトリに戻した record（ディスク上の内容）
    Declined(TaskRecord),
}

/// TaskStore はタスクファイルの永続化を担う
///
/// # 設計原則
/// - 書き込みは一時ファイル + rename で原子的（読み手は旧版か新版しか見ない）
/// - `move_to` はまず rename する。rename の勝者だけが遷移を所有し、
///   敗者は `StoreError::Missing` を受け取る（locked/ への移動がロックになる）
/// - ファイル名はタスクの生涯を通じて変わらない
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 全ライフサイクルディレクトリを作成し、書きかけの一時ファイルを掃除する
    async fn ensure_layout(&self) -> Result<(), StoreError>;

    /// `dir` に record を原子的に書く。ファイル名が未定なら割り当てる。
    async fn write(&self, task: &mut TaskRecord, dir: LifecycleDir) -> Result<(), StoreError>;

    /// `from` から `to` へ移動し、移動先を record の内容で書き直す
    ///
    /// 書き直しに失敗した場合はファイルを `from` に戻す。呼び出し側が
    /// そのファイルを所有している（locked/ 内の実行中タスクなど）ときに使う。
    async fn move_to(
        &self,
        task: &mut TaskRecord,
        from: LifecycleDir,
        to: LifecycleDir,
    ) -> Result<(), StoreError>;

    /// `file_name` を `from` から `to` へ rename し、ディスク上の record に
    /// `update` を適用して書き直す
    ///
    /// メモリ上のコピーではなく移動したファイルの中身を正とする。`update` が
    /// false を返した場合、あるいは rename 後のどこかで失敗した場合は、
    /// ファイルを `from` に戻してから返す。
    async fn take(
        &self,
        file_name: &str,
        from: LifecycleDir,
        to: LifecycleDir,
        update: &(dyn for<'u> Fn(&'u mut TaskRecord) -> bool + Send + Sync),
    ) -> Result<Taken, StoreError>;

    /// `dir` 内のタスクファイルを全て読む（壊れたものは Corrupt として返す）
    async fn scan(&self, dir: LifecycleDir) -> Result<Vec<ScanEntry>, StoreError>;

    /// `dir` 内のタスクファイル名（一時ファイル等は除外）
    async fn list_file_names(&self, dir: LifecycleDir) -> Result<Vec<String>, StoreError>;

    async fn read_file(&self, dir: LifecycleDir, file_name: &str)
    -> Result<TaskRecord, StoreError>;

    /// ファイルを削除。既に無ければ `StoreError::Missing`
    async fn remove_file(&self, dir: LifecycleDir, file_name: &str) -> Result<(), StoreError>;

    /// `dir` 内の読めるタスクを全て返す（壊れたファイルは黙って飛ばす）
    async fn list_all(&self, dir: LifecycleDir) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .scan(dir)
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                ScanEntry::Task(task) => Some(task),
                ScanEntry::Corrupt { .. } => None,
            })
            .collect())
    }

    /// record のファイルを物理削除する
    async fn delete(&self, task: &TaskRecord, dir: LifecycleDir) -> Result<(), StoreError> {
        match task.file_name.as_deref() {
            Some(name) => self.remove_file(dir, name).await,
            None => Ok(()),
        }
    }

    /// `dirs` の中から id のタスクを探す（最初に見つかったもの）
    async fn find(
        &self,
        id: TaskId,
        dirs: &[LifecycleDir],
    ) -> Result<Option<(LifecycleDir, String)>, StoreError>;

    /// 読めないファイルを failed/ に隔離する
    ///
    /// ファイル名から id が読めないときは `fallback_id` を使う。
    async fn quarantine(
        &self,
        dir: LifecycleDir,
        file_name: &str,
        reason: &str,
        fallback_id: TaskId,
        now_ms: i64,
    ) -> Result<TaskRecord, StoreError>;

    async fn count(&self, dir: LifecycleDir) -> Result<usize, StoreError>;

    /// `cutoff_ms` より前に終わったタスクを物理削除し、件数を返す
    ///
    /// 対象は `completed/` の全件と、`failed/` のうち `deleted` が立っているもの。
    async fn purge_completed_before(&self, cutoff_ms: i64) -> Result<usize, StoreError>;
}
