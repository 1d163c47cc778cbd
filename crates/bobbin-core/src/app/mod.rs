//! App - アプリケーション層
//!
//! ports と lease/patch を組み合わせて polling loop を構成します。
//!
//! # 主要コンポーネント
//! - **ListenerBuilder**: wiring and fail-fast validation
//! - **Listener**: per task type polling loop
//! - **TaskHandler**: user code run for each leased task
//! - **ListenerConfig**: JSON-loadable settings

pub mod builder;
pub mod config;
pub mod handler;
pub mod listener;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ListenerBuilder};
pub use self::config::ListenerConfig;
pub use self::handler::{HandlerFn, TaskHandler, handler_fn};
pub use self::listener::Listener;
