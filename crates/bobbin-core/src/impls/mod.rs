//! Impls - ports の実装
//!
//! - **InMemoryTaskStore**: 開発用・テスト用の正本
//! - **RetryingStore**: transient failure backoff around any store
//!
//! Production stores (document databases) live in downstream crates.

pub mod inmem_store;
pub mod retrying_store;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::retrying_store::RetryingStore;
