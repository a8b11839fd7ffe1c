//! Handler trait - Task を実行する Handler の定義
//!
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::task::Task;
use crate::domain::{TaskError, TaskRecord};

/// Handler は復元した Task を処理する
///
/// # 使用例
/// ```ignore
/// struct WelcomeMailHandler;
///
/// #[async_trait]
/// impl Handler<SendWelcomeMail> for WelcomeMailHandler {
///     async fn handle(&self, task: SendWelcomeMail, _record: &TaskRecord) -> Result<(), TaskError> {
///         mailer::send(task.user_id).await.map_err(|e| TaskError::transient(e.to_string()))
///     }
/// }
/// ```
///
/// `Ok(())` で completed/、`Err` で Decider が retry か failed/ かを決める。
/// `record` は読み取り専用（id, try_count, custom_key などの参照用）。
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, record: &TaskRecord) -> Result<(), TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納するための型消去層。
#[async_trait]
pub trait DynHandler: Send + Sync {
    /// `dataJson` を復元して処理する。復元できない payload は Permanent。
    async fn handle_dyn(&self, record: &TaskRecord) -> Result<(), TaskError>;

    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let task: T = PayloadCodec::decode(&record.data_json)
            .map_err(|e| TaskError::permanent(e.to_string()))?;
        self.handler.handle(task, record).await
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::TestTaskHandler;
    use super::*;
    use crate::domain::{ErrorKind, TaskId};
    use crate::typed::task::fixtures::TestTask;

    fn record(data_json: &str) -> TaskRecord {
        TaskRecord::new(TaskId::new(1), TestTask::TYPE, data_json, None, 0, 0)
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_runs() {
        let handler = TypedHandler::<TestTask, _>::new(TestTaskHandler);
        assert_eq!(handler.task_type(), TestTask::TYPE);
        assert!(handler.handle_dyn(&record(r#"{"value":100}"#)).await.is_ok());

        let err = handler.handle_dyn(&record(r#"{"value":-1}"#)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = TypedHandler::<TestTask, _>::new(TestTaskHandler);
        let err = handler.handle_dyn(&record("not json")).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
