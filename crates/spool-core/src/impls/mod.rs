//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **FileTaskStore**: ローカルディスク上のライフサイクルディレクトリ

pub mod file_store;

pub use self::file_store::FileTaskStore;
