use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every attempt.
    #[default]
    Constant,
    /// Doubling delay with jitter, capped at `max_delay`.
    Exponential,
}

/// Retry envelope shared by the publisher and the reconnector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.delay,
            Backoff::Exponential => {
                let base = self.delay.as_millis() as u64;
                let cap = self.max_delay.as_millis() as u64;
                let delay = base.saturating_mul(1u64 << retry.min(20)).min(cap);

                let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                let delay = (delay as f64 + jitter).max(0.0) as u64;
                Duration::from_millis(delay.min(cap))
            }
        }
    }
}
