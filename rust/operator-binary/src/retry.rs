//! Exponential backoff helpers.
//!
//! [`poll_until`] waits a bounded amount of time for a condition, [`RequeueBackoff`] spaces out
//! retries of failed reconciliations per key.
use snafu::Snafu;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, PoisonError},
    time::Duration,
};

/// Exponentially growing delays between a fixed number of attempts
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub factor: u32,
    /// Number of times the condition is checked
    pub steps: u32,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2,
            steps: 6,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// The delay slept after the `attempt`th failed check, counting from zero
    pub fn delay(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|multiplier| self.initial_delay.checked_mul(multiplier))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, PartialEq, Snafu)]
#[snafu(display("condition was not met after {attempts} attempts"))]
pub struct PollTimeout {
    pub attempts: u32,
}

/// Checks `condition` until it holds, sleeping between checks according to `backoff`.
///
/// Returns the number of checks it took. The future can be dropped at any point to cancel.
pub async fn poll_until<F>(backoff: &Backoff, mut condition: F) -> Result<u32, PollTimeout>
where
    F: FnMut() -> bool,
{
    for attempt in 0..backoff.steps {
        if condition() {
            return Ok(attempt + 1);
        }
        if attempt + 1 < backoff.steps {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }
    PollTimeoutSnafu {
        attempts: backoff.steps,
    }
    .fail()
}

/// Per-key exponential requeue delays, reset once a key succeeds
#[derive(Debug)]
pub struct RequeueBackoff<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> RequeueBackoff<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying it
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = 2u32
            .checked_pow(*count)
            .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));
        *count = count.saturating_add(1);
        delay
    }

    pub fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
