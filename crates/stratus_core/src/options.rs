//! Per-resource options: ordering edges, deadlines and retry policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::resource::{ResourceId, ResourceRef};

/// Delay before a retry, by retry number (starting at 1).
#[derive(Clone, Default)]
pub enum Backoff {
    #[default]
    None,
    Fixed(Duration),
    Exponential {
        base: Duration,
        max: Duration,
    },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32 << retry.saturating_sub(1).min(16);
                base.saturating_mul(factor).min(*max)
            }
            Backoff::Custom(f) => f(retry),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::None => write!(f, "None"),
            Backoff::Fixed(delay) => write!(f, "Fixed({:?})", delay),
            Backoff::Exponential { base, max } => {
                write!(f, "Exponential {{ base: {:?}, max: {:?} }}", base, max)
            }
            Backoff::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How many times a failed apply is re-invoked.
///
/// The default never retries.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(retries: u32, backoff: Backoff) -> Self {
        Self { retries, backoff }
    }
}

/// Options attached to a resource declaration.
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    /// Resources that must settle first even though no input references them.
    pub depends_on: Vec<ResourceId>,
    /// Deadline for each apply attempt; falls back to the run configuration.
    pub timeout: Option<Duration>,
    /// Retry policy; falls back to the run configuration.
    pub retry: Option<RetryPolicy>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on(mut self, resource: &ResourceRef) -> Self {
        self.depends_on.push(resource.id());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}
