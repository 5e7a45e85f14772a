//! Bounded polling for asynchronous provider work

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{ProviderError, Result};

/// Backoff schedule for a wait: starts at `initial_interval`, doubles up to
/// `max_interval`, and gives up after `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    /// Constant interval polling.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            timeout,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Call `check` until it yields a value, an error, or the deadline passes.
///
/// The deadline bounds the wait only; a check already in flight is not
/// cancelled.
pub async fn poll_until<T, F, Fut>(what: &str, policy: PollPolicy, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut interval = policy.initial_interval;

    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ProviderError::Timeout {
                what: what.to_string(),
                after: policy.timeout,
            });
        }

        sleep(interval.min(deadline - now)).await;
        interval = (interval * 2).min(policy.max_interval);
    }
}
