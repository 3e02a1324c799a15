//! Token quota shared by every session of an engine.
//!
//! The counter is advisory: it records consumption and reports a balance, but
//! never refuses a call. A negative balance simply means "over quota".

use crate::output::TokenStatus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{info, warn};

/// Number of most recent consumptions summed into `recent_usage`.
pub const RECENT_WINDOW: usize = 10;

/// Process-wide token budget, decremented by every transformation call.
#[derive(Debug)]
pub struct UsageCounter {
    max: u64,
    remaining: AtomicI64,
    recent: Mutex<VecDeque<u64>>,
}

impl UsageCounter {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            remaining: AtomicI64::new(saturating_i64(max)),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_WINDOW)),
        }
    }

    /// Subtract `tokens` from the balance and return the new balance.
    pub fn consume(&self, tokens: u64) -> i64 {
        let n = saturating_i64(tokens);
        let after = self.remaining.fetch_sub(n, Ordering::SeqCst) - n;

        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_WINDOW {
                recent.pop_front();
            }
            recent.push_back(tokens);
        }

        if after < saturating_i64(self.max / 10) {
            warn!("Low token balance: {} of {} remaining", after, self.max);
        }
        after
    }

    /// Restore the balance to the configured maximum.
    pub fn reset(&self) -> i64 {
        let max = saturating_i64(self.max);
        self.remaining.store(max, Ordering::SeqCst);
        info!("Token count reset to {}", max);
        max
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn status(&self) -> TokenStatus {
        let remaining = self.remaining();
        let usage_percentage = if self.max == 0 {
            0.0
        } else {
            let used = self.max as f64 - remaining as f64;
            (used / self.max as f64 * 1000.0).round() / 10.0
        };
        TokenStatus {
            remaining,
            max: self.max,
            usage_percentage,
            recent_usage: self.recent.lock().iter().sum(),
        }
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_decrements_exactly() {
        let counter = UsageCounter::new(1_000);
        assert_eq!(counter.consume(250), 750);
        assert_eq!(counter.remaining(), 750);
    }

    #[test]
    fn balance_may_go_negative() {
        let counter = UsageCounter::new(100);
        counter.consume(80);
        assert_eq!(counter.consume(50), -30);
        let status = counter.status();
        assert_eq!(status.remaining, -30);
        assert_eq!(status.usage_percentage, 130.0);
    }

    #[test]
    fn reset_restores_max_from_negative() {
        let counter = UsageCounter::new(100);
        counter.consume(500);
        assert_eq!(counter.reset(), 100);
        assert_eq!(counter.remaining(), 100);
    }

    #[test]
    fn usage_percentage_is_rounded_to_one_decimal() {
        let counter = UsageCounter::new(3);
        counter.consume(1);
        assert_eq!(counter.status().usage_percentage, 33.3);
    }

    #[test]
    fn recent_usage_keeps_last_window() {
        let counter = UsageCounter::new(1_000_000);
        for _ in 0..RECENT_WINDOW {
            counter.consume(1);
        }
        counter.consume(100);
        // oldest `1` dropped, newest `100` added
        assert_eq!(counter.status().recent_usage, (RECENT_WINDOW as u64 - 1) + 100);
    }

    #[test]
    fn zero_max_reports_zero_percent() {
        let counter = UsageCounter::new(0);
        counter.consume(10);
        assert_eq!(counter.status().usage_percentage, 0.0);
    }
}
