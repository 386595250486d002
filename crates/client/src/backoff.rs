//! Backoff schedules for retrying failed operations.
//!
//! A schedule is a pure function of the attempt number (and the error that
//! triggered the retry). It decides whether another try is allowed and how
//! long to wait before it. Schedules hold no state, so one instance can be
//! shared by every operation of a client.
//!
//! # Attempt numbering
//!
//! `attempt` counts the retries already granted in the current sequence. The
//! first decision after the first failure is made with `attempt = 0`.
//!
//! # Exponential schedule
//!
//! ```text
//! delay[n] = min(min_backoff + delta * (2^n - 1), max_backoff)
//! ```
//!
//! With the defaults (min 100ms, delta 100ms, max 10s):
//! - Attempt 0: wait 100ms
//! - Attempt 1: wait 200ms
//! - Attempt 2: wait 400ms
//! - Attempt 3: wait 800ms
//! - ...
//! - Attempt 7+: wait 10s (capped)
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use skylink_client::backoff::{BackoffPolicy, ExponentialBackoff, RetryDecision};
//!
//! let backoff = ExponentialBackoff::default();
//! assert_eq!(
//!     backoff.decide(0, &err),
//!     RetryDecision::Retry(Duration::from_millis(100))
//! );
//! ```

use std::time::Duration;

use crate::error::ClientError;

/// Outcome of consulting a backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay. A zero delay retries immediately.
    Retry(Duration),
    /// Give up and surface the last error.
    Stop,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry(_))
    }
}

/// Maps an attempt number to a retry decision.
pub trait BackoffPolicy: Send + Sync {
    /// Decides what to do after a transient failure.
    ///
    /// # Arguments
    /// - `attempt`: retries already granted in this sequence (0 for the first decision)
    /// - `error`: the failure that triggered the decision
    fn decide(&self, attempt: u32, error: &ClientError) -> RetryDecision;
}

/// Exponentially growing delays with an optional retry limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Maximum number of retries. `None` retries forever.
    max_retries: Option<u32>,
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
}

impl ExponentialBackoff {
    /// Creates an exponential schedule.
    ///
    /// # Arguments
    /// - `max_retries`: retry limit, or `None` for unbounded
    /// - `min`: delay before the first retry
    /// - `max`: cap on any single delay
    /// - `delta`: growth unit added in powers of two
    pub fn new(max_retries: Option<u32>, min: Duration, max: Duration, delta: Duration) -> Self {
        Self {
            max_retries,
            min_backoff: min,
            max_backoff: max.max(min),
            delta_backoff: delta,
        }
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Computes the delay for a given attempt without checking the retry limit.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^attempt overflows quickly; anything past 2^31 is capped anyway
        let factor = 1u64
            .checked_shl(attempt.min(31))
            .map(|f| f - 1)
            .unwrap_or(u64::MAX);
        let grown_ms = (self.delta_backoff.as_millis() as u64).saturating_mul(factor);
        let total = self
            .min_backoff
            .saturating_add(Duration::from_millis(grown_ms));
        total.min(self.max_backoff)
    }
}

impl Default for ExponentialBackoff {
    /// Unbounded retries, 100ms initial delay, 10s cap, 100ms growth unit.
    fn default() -> Self {
        Self::new(
            None,
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_millis(100),
        )
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn decide(&self, attempt: u32, _error: &ClientError) -> RetryDecision {
        match self.max_retries {
            Some(limit) if attempt >= limit => RetryDecision::Stop,
            _ => RetryDecision::Retry(self.delay_for(attempt)),
        }
    }
}

/// The same delay before every retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    max_retries: Option<u32>,
    delay: Duration,
}

impl FixedDelay {
    pub fn new(max_retries: Option<u32>, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl BackoffPolicy for FixedDelay {
    fn decide(&self, attempt: u32, _error: &ClientError) -> RetryDecision {
        match self.max_retries {
            Some(limit) if attempt >= limit => RetryDecision::Stop,
            _ => RetryDecision::Retry(self.delay),
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl BackoffPolicy for NoRetry {
    fn decide(&self, _attempt: u32, _error: &ClientError) -> RetryDecision {
        RetryDecision::Stop
    }
}
