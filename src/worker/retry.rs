//! Retry backoff

use std::time::Duration;

use rand::Rng;

/// How long a failed task waits before its next attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// `n^4 + 15 + rand(0..30) * (n + 1)` seconds, capped at `max_delay`
    Polynomial { max_delay: Duration },
    /// Same delay for every attempt
    Fixed(Duration),
}

impl RetryPolicy {
    /// Delay before the attempt that follows `retried` failures
    pub fn delay(&self, retried: u32) -> Duration {
        match self {
            RetryPolicy::Polynomial { max_delay } => {
                let n = u64::from(retried);
                let jitter = rand::thread_rng().gen_range(0..30u64) * (n + 1);
                let secs = n.saturating_pow(4).saturating_add(15).saturating_add(jitter);
                Duration::from_secs(secs).min(*max_delay)
            }
            RetryPolicy::Fixed(delay) => *delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Polynomial {
            max_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}
