//! ListenerBuilder - wiring of store, clock, id generator and handler
//!
//! # 起動時検証（Fail-fast 設計）
//! - store and handler are required
//! - the config is checked before any polling starts
//! - clock and id generator default to the system clock and ULIDs

use std::sync::Arc;

use super::config::ListenerConfig;
use super::handler::TaskHandler;
use super::listener::Listener;
use crate::domain::TaskType;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

/// # 使用例
/// ```ignore
/// let listener = ListenerBuilder::new("mail")
///     .store(store)
///     .handler(SendMail)
///     .config(config)
///     .build()?;
/// listener.start()?;
/// ```
pub struct ListenerBuilder {
    task_type: TaskType,
    config: ListenerConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    handler: Option<Arc<dyn TaskHandler>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no task store configured for task_type={0}")]
    MissingStore(TaskType),
    #[error("no handler registered for task_type={0}")]
    MissingHandler(TaskType),
    #[error("invalid listener config: {0}")]
    InvalidConfig(String),
}

impl ListenerBuilder {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_type: task_type.into(),
            config: ListenerConfig::default(),
            store: None,
            clock: None,
            ids: None,
            handler: None,
        }
    }

    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
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

    pub fn handler<H: TaskHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Listener, BuildError> {
        if let Some(problem) = self.config.problem() {
            return Err(BuildError::InvalidConfig(problem));
        }
        let store = self
            .store
            .ok_or_else(|| BuildError::MissingStore(self.task_type.clone()))?;
        let handler = self
            .handler
            .ok_or_else(|| BuildError::MissingHandler(self.task_type.clone()))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())) as Arc<dyn IdGenerator>);

        Ok(Listener::new(
            self.task_type,
            self.config,
            store,
            clock,
            ids,
            handler,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler::handler_fn;
    use crate::impls::InMemoryTaskStore;

    fn store() -> Arc<dyn TaskStore> {
        Arc::new(InMemoryTaskStore::new(Arc::new(SystemClock::new())))
    }

    #[test]
    fn builds_with_store_and_handler() {
        let listener = ListenerBuilder::new("mail")
            .store(store())
            .handler(handler_fn(|_task| async { Ok(()) }))
            .build()
            .unwrap();
        assert_eq!(listener.task_type(), &TaskType::new("mail"));
        assert!(!listener.is_running());
        assert_eq!(listener.active_count(), 0);
    }

    #[test]
    fn missing_handler_is_reported() {
        let err = ListenerBuilder::new("mail").store(store()).build().err();
        assert_eq!(err, Some(BuildError::MissingHandler(TaskType::new("mail"))));
    }

    #[test]
    fn missing_store_is_reported() {
        let err = ListenerBuilder::new("mail")
            .handler(handler_fn(|_task| async { Ok(()) }))
            .build()
            .err();
        assert_eq!(err, Some(BuildError::MissingStore(TaskType::new("mail"))));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = ListenerConfig {
            lease_duration_ms: 0,
            ..Default::default()
        };
        let err = ListenerBuilder::new("mail")
            .store(store())
            .handler(handler_fn(|_task| async { Ok(()) }))
            .config(config)
            .build()
            .err();
        assert!(matches!(err, Some(BuildError::InvalidConfig(_))));
    }
}
