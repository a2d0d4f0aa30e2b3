//! Run configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::options::{Backoff, RetryPolicy};

/// Engine settings applied to every resource unless overridden by its
/// [`ResourceOptions`](crate::ResourceOptions).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Deadline for each apply attempt in seconds (0 = no deadline)
    pub apply_timeout_seconds: u64,
    /// Maximum concurrent provider calls (0 = unbounded)
    pub max_concurrency: usize,
    /// Retries after a failed apply
    pub retries: u32,
    /// Fixed delay between retries in milliseconds
    pub retry_backoff_ms: u64,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_timeout_seconds(mut self, seconds: u64) -> Self {
        self.apply_timeout_seconds = seconds;
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    pub fn retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn apply_timeout(&self) -> Option<Duration> {
        (self.apply_timeout_seconds > 0).then(|| Duration::from_secs(self.apply_timeout_seconds))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.retry_backoff_ms > 0 {
            Backoff::Fixed(Duration::from_millis(self.retry_backoff_ms))
        } else {
            Backoff::None
        };
        RetryPolicy::new(self.retries, backoff)
    }
}
