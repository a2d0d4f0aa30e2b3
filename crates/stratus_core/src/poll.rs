//! Re-polling for eventually-available remote values.
//!
//! Some outputs only exist after a runtime side effect: a load balancer
//! reports its address as "Pending" until one is allocated. Providers use
//! [`poll_until`] so such placeholders never reach a settled output.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Outcome of one probe of a remote value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
}

impl Probe<String> {
    /// Treat missing, empty, or placeholder text as not yet available.
    pub fn from_reported(reported: Option<&str>, placeholder: &str) -> Self {
        match reported {
            Some(value) if !value.is_empty() && !value.eq_ignore_ascii_case(placeholder) => {
                Probe::Ready(value.to_string())
            }
            _ => Probe::Pending,
        }
    }
}

/// Interval and overall deadline of a polling loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Probe until a real value is available or the deadline passes.
///
/// The first probe runs immediately; later probes wait `interval`. A probe
/// error ends polling with that error. Exceeding the deadline fails with
/// [`CoreError::Timeout`] naming `resource`.
pub async fn poll_until<T, F, Fut>(resource: &str, config: &PollConfig, mut probe: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<Probe<T>>>,
{
    let polling = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match probe().await? {
                Probe::Ready(value) => {
                    debug!("{} ready after {} probes", resource, attempt);
                    return CoreResult::Ok(value);
                }
                Probe::Pending => {
                    debug!("{} still pending (probe {})", resource, attempt);
                    tokio::time::sleep(config.interval).await;
                }
            }
        }
    };

    match tokio::time::timeout(config.timeout, polling).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            resource: resource.to_string(),
            after: config.timeout,
        }),
    }
}
