//! Backoff policy for transient generation failures.
//!
//! Only rate limits are retried, and the server's own retry hint takes
//! precedence over the policy delay whenever it is longer.

use std::time::Duration;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }

    /// Delay before the next attempt, honouring a server-provided
    /// retry-after hint when it exceeds the policy's own delay.
    pub fn delay_with_hint(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        let own = self.delay_for_attempt(attempt);
        match hint {
            Some(h) if h > own => h,
            _ => own,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}
