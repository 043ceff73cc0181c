//! Reconnect backoff.
//!
//! A failed connect attempt is retried after `2^(n-1)` seconds, where `n` counts the consecutive
//! failures so far, never less than one second and never more than the configured cap. The count
//! starts over with every connect cycle and after a successful connect.
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use crate::options::RetryPolicy;

/// Shortest delay before a retry.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Delay before retry number `retry_count` (1-based), capped at `max`.
///
/// ```
/// use std::time::Duration;
/// use wsclient::retry::backoff_delay;
///
/// let cap = Duration::from_secs(30);
/// assert_eq!(backoff_delay(1, cap), Duration::from_secs(1));
/// assert_eq!(backoff_delay(4, cap), Duration::from_secs(8));
/// assert_eq!(backoff_delay(20, cap), cap);
/// ```
pub fn backoff_delay(retry_count: u32, max: Duration) -> Duration {
    let exp = retry_count.saturating_sub(1).min(31);
    let delay = MIN_BACKOFF.saturating_mul(1u32 << exp);
    delay.min(max).max(MIN_BACKOFF)
}

/// What to do after a failed connect attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Wait `delay` and run attempt number `attempt` again.
    Retry { attempt: u32, delay: Duration },
    /// The retry budget is spent.
    Exhausted { attempts: u32 },
    /// Retrying is disabled; the failure goes straight to the caller.
    Surface,
}

/// Counts consecutive connect failures and decides whether to try again.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    limit: u32,
    max: Duration,
    count: AtomicU32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy, limit: u32, max: Duration) -> Self {
        Self {
            policy,
            limit,
            max,
            count: AtomicU32::new(0),
        }
    }

    /// Consecutive failures since the last successful connect.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Records a failure and returns the next step.
    pub fn on_failure(&self) -> Decision {
        if self.policy == RetryPolicy::Return {
            return Decision::Surface;
        }

        let attempt = self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if attempt > self.limit {
            return Decision::Exhausted { attempts: attempt };
        }

        Decision::Retry {
            attempt,
            delay: backoff_delay(attempt, self.max),
        }
    }

    /// Starts a new connect cycle, or records a successful connect.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}
