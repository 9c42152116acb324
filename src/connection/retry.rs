//! Reconnection policy

use std::cmp::min;
use std::fmt;
use std::time::Duration;
use trailer_shared::{classify, link, DeviceError, ErrorClass};

/// When and how fast the session reconnects after a failed connection
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first reconnect
    pub initial_delay: Duration,
    /// Maximum reconnection delay
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up (None = forever)
    pub max_retries: Option<u32>,
    /// Which connection errors are retried
    pub classify: fn(&DeviceError) -> ErrorClass,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(link::RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(link::MAX_RECONNECT_DELAY_MS),
            max_retries: None,
            classify,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Reconnect right away, without backoff
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            delay: self.initial_delay,
            failures: 0,
        }
    }
}

/// Exponential backoff state for one session pipeline
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    delay: Duration,
    failures: u32,
}

impl Backoff {
    /// Record a failed attempt; returns the wait before the next one, or
    /// `None` once the policy gives up.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if let Some(max) = self.policy.max_retries {
            if self.failures > max {
                return None;
            }
        }

        let delay = self.delay;
        self.delay = min(self.delay.saturating_mul(2), self.policy.max_delay);
        Some(delay)
    }

    /// Forget past failures after a successful connection
    pub(crate) fn reset(&mut self) {
        self.delay = self.policy.initial_delay;
        self.failures = 0;
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let mut backoff = policy.backoff();

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = RetryPolicy::default().backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(
            backoff.next_delay(),
            Some(Duration::from_millis(link::RECONNECT_DELAY_MS))
        );
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy {
            max_retries: Some(2),
            ..RetryPolicy::immediate()
        };
        let mut backoff = policy.backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.failures(), 3);
    }
}
