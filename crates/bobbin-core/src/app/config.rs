//! Listener configuration, loadable from JSON.

use serde::{Deserialize, Serialize};

use crate::lease::{HolderSettings, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Upper bound on concurrently processed tasks.
    pub max_active_tasks: usize,
    pub poll_interval_ms: u64,
    /// Random extra delay added to each idle poll.
    pub poll_jitter_ms: u64,
    pub lease_duration_ms: i64,
    /// Disable-poll period of each holder; 0 turns it off.
    pub refresh_interval_ms: u64,
    pub retries: u32,
    /// Delays after consecutive acquire failures, used cyclically.
    pub poll_failure_backoff_ms: Vec<u64>,
    pub retry_policy: RetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: 5,
            poll_interval_ms: 5_000,
            poll_jitter_ms: 250,
            lease_duration_ms: 30_000,
            refresh_interval_ms: 30_000,
            retries: 4,
            poll_failure_backoff_ms: vec![500, 1_000, 2_000, 5_000, 10_000],
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ListenerConfig {
    pub fn holder_settings(&self) -> HolderSettings {
        HolderSettings {
            lease_duration_ms: self.lease_duration_ms,
            refresh_interval_ms: self.refresh_interval_ms,
            retries: self.retries,
            retry_policy: self.retry_policy.clone(),
        }
    }

    /// Why this config cannot drive a listener, if it cannot.
    pub fn problem(&self) -> Option<String> {
        if self.max_active_tasks == 0 {
            return Some("max_active_tasks must be positive".to_string());
        }
        if self.lease_duration_ms <= 0 {
            return Some("lease_duration_ms must be positive".to_string());
        }
        if self.poll_failure_backoff_ms.is_empty() {
            return Some("poll_failure_backoff_ms must not be empty".to_string());
        }
        None
    }
}
