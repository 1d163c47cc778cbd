//! TaskHandler trait - user code run for each leased task.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::BobbinError;
use crate::lease::LeaseHolder;

/// Handler は leased task を処理する
///
/// # 使用例
/// ```ignore
/// struct SendMail;
///
/// #[async_trait]
/// impl TaskHandler for SendMail {
///     async fn handle(&self, task: LeaseHolder) -> Result<(), BobbinError> {
///         let mail: Mail = task.payload_as()?;
///         deliver(&mail).await?;
///         task.complete(None, FinishOptions::default()).await?;
///         Ok(())
///     }
/// }
/// ```
///
/// # 暗黙の終了処理
/// - returning `Ok` without finishing completes the task
/// - returning `Err` retries it without saving payload edits
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: LeaseHolder) -> Result<(), BobbinError>;
}

/// Adapter turning an async closure into a `TaskHandler`.
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(LeaseHolder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BobbinError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(LeaseHolder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BobbinError>> + Send + 'static,
{
    async fn handle(&self, task: LeaseHolder) -> Result<(), BobbinError> {
        (self.0)(task).await
    }
}
