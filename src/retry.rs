//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The realtime worker uses
//! [`ReconnectPolicy`] to space out reconnect attempts and [`with_timeout`] to
//! bound the session-attach handshake.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts after a connection loss.
    ///
    /// `0` retries until the client is closed.
    pub max_attempts: usize,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    pub multiplier: u32,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Retries forever with the default delays.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based. The exponential part never exceeds
    /// `max_backoff`; jitter is added on top of the capped value.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let multiplier = self.multiplier.max(1);
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(multiplier), self.max_backoff);
            if delay == self.max_backoff {
                break;
            }
        }
        delay + jitter_duration(self.jitter)
    }

    /// Returns whether another attempt is permitted after `attempts_made`
    /// failed attempts.
    pub fn allows_attempt(&self, attempts_made: usize) -> bool {
        self.max_attempts == 0 || attempts_made < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            jitter: Duration::from_millis(250),
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration) -> Duration {
    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..=limit_nanos))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy};

    fn policy_without_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(50),
            ..policy_without_jitter()
        };
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            let base = policy_without_jitter().delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(50));
        }
    }

    #[test]
    fn attempt_cap_is_respected() {
        let policy = policy_without_jitter();
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
        assert!(ReconnectPolicy::unlimited().allows_attempt(usize::MAX - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_reports_elapsed() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(result.is_err());
        let result = with_timeout(Duration::from_millis(10), async { 7 }).await;
        assert_eq!(result.expect("completes"), 7);
    }
}
