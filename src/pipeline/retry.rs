//! Retry policy for transformation calls.
//!
//! The policy is a plain value: how many attempts, how long to wait before
//! each retry, and *how* to wait. Waiting goes through a [`Sleeper`] so tests
//! can count and inspect delays without real time passing.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Suspends the calling task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(retry-1)`: base, 2×base, 4×base, …
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based: the second attempt is retry 1).
    pub fn delay_before(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor)
            }
        }
    }
}

/// Bounded retry for timeouts and connection failures.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// `max_attempts` counts the first call; it is raised to at least 1.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper, e.g. with one that records delays in tests.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Wait before the `retry`-th retry.
    pub async fn pause(&self, retry: u32) {
        self.sleeper.sleep(self.backoff.delay_before(retry)).await;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            Backoff::Fixed(Duration::from_millis(1500)),
        )
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().push(duration);
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let b = Backoff::Fixed(Duration::from_millis(1500));
        assert_eq!(b.delay_before(1), Duration::from_millis(1500));
        assert_eq!(b.delay_before(4), Duration::from_millis(1500));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let b = Backoff::Exponential {
            base: Duration::from_millis(500),
        };
        assert_eq!(b.delay_before(1), Duration::from_millis(500));
        assert_eq!(b.delay_before(2), Duration::from_secs(1));
        assert_eq!(b.delay_before(3), Duration::from_secs(2));
    }

    #[test]
    fn zero_attempts_is_raised_to_one() {
        let p = RetryPolicy::new(0, Backoff::Fixed(Duration::ZERO));
        assert_eq!(p.max_attempts(), 1);
    }

    #[test]
    fn default_is_five_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), 5);
    }

    #[tokio::test]
    async fn pause_goes_through_the_sleeper() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(2)))
            .with_sleeper(sleeper.clone());
        policy.pause(1).await;
        policy.pause(2).await;
        assert_eq!(*sleeper.0.lock(), vec![Duration::from_secs(2); 2]);
    }
}
