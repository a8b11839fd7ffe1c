//! Task trait - 型付き Task の定義
//!
//! Task 型のフィールドがそのまま `dataJson` になり、`TYPE` が `handlerName` になる。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は handlerName と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendWelcomeMail {
///     user_id: u64,
/// }
///
/// impl Task for SendWelcomeMail {
///     const TYPE: &'static str = "accounts.welcome_mail.send.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: `dataJson` への保存のため
/// - `DeserializeOwned`: `dataJson` からの復元のため
/// - `Send + Sync + 'static`: ワーカータスクへ渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// handlerName として保存される登録キー
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    /// - ファイル名にも短縮形で現れるので、英数字とドットが読みやすい
    const TYPE: &'static str;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::Task;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TestTask {
        pub value: i32,
    }

    impl Task for TestTask {
        const TYPE: &'static str = "test.task.create.v1";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct AnotherTestTask {
        pub name: String,
        pub family: HashMap<String, String>,
    }

    impl Task for AnotherTestTask {
        const TYPE: &'static str = "test.task.another.v1";
    }
}
