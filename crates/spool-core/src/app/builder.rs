//! CoordinatorBuilder - Coordinator の構築とワイヤリング
//!
//! - Builder パターン
//! - 起動時検証（Fail-fast）：設定の妥当性と、期待される handler の登録漏れ

use std::sync::Arc;

use super::coordinator::Coordinator;
use crate::config::{ConfigError, QueueConfig};
use crate::domain::{Decider, DefaultDecider};
use crate::impls::FileTaskStore;
use crate::ports::{Clock, IdGenerator, SequenceIdGenerator, SystemClock, TaskStore};
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// CoordinatorBuilder は Coordinator を構築
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(QueueConfig::new("/var/lib/app"))
///     .register::<SendWelcomeMail, _>(WelcomeMailHandler)?
///     .expect_tasks(&[SendWelcomeMail::TYPE])
///     .build()?;
/// coordinator.startup().await?;
/// ```
///
/// 差し替えなければ SystemClock / SequenceIdGenerator / DefaultDecider /
/// FileTaskStore（`config.data_dir` 配下）が使われる。
pub struct CoordinatorBuilder {
    config: QueueConfig,
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoordinatorBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            registry: TypedRegistry::new(),
            expected_tasks: None,
            store: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される handlerName のリストを設定（build 時に登録漏れを検出）
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// 検証してから Coordinator を生成
    ///
    /// # 検証
    /// - `QueueConfig::validate()`
    /// - expect_tasks() の task_type が全て登録されているか
    pub fn build(self) -> Result<Coordinator, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(SequenceIdGenerator::new(Arc::clone(&clock))),
        };
        let decider: Arc<dyn Decider> = match self.decider {
            Some(decider) => decider,
            None => Arc::new(DefaultDecider::new(self.config.retry.to_policy())),
        };
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileTaskStore::new(&self.config.data_dir)),
        };

        Ok(Coordinator::from_parts(
            self.config,
            store,
            self.registry,
            decider,
            clock,
            ids,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::TestTaskHandler;
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};

    fn config() -> QueueConfig {
        QueueConfig::new("unused-data-dir")
    }

    #[test]
    fn test_build_success() {
        let coordinator = CoordinatorBuilder::new(config())
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .expect_tasks(&[TestTask::TYPE])
            .build();
        assert!(coordinator.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let coordinator = CoordinatorBuilder::new(config())
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .expect_tasks(&[TestTask::TYPE, AnotherTestTask::TYPE])
            .build();
        assert!(matches!(
            coordinator,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![AnotherTestTask::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = config();
        config.worker_count = 0;
        let coordinator = CoordinatorBuilder::new(config).build();
        assert!(matches!(coordinator, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        let coordinator = CoordinatorBuilder::new(config())
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(coordinator.registry().registered_types(), vec![TestTask::TYPE.to_string()]);
    }
}
