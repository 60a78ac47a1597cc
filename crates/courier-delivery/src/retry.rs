//! Exponential backoff for failed deliveries.
//!
//! The delay before attempt `n + 1` is `retry_delay_seconds × 2^(n−1)`,
//! capped at one hour. There is no jitter: schedules are reproducible so
//! operators can predict when a delivery is next due.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{Delivery, Endpoint};

/// Upper bound on any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Retry policy of one delivery.
///
/// `max_attempts` comes from the delivery row, where it was frozen at
/// dispatch; `base_delay` from the endpoint's current configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: i32,
    /// Backoff base.
    pub base_delay: Duration,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again once `next_attempt_at` has passed.
    Retry {
        /// When the delivery becomes due.
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts are exhausted; the failure is terminal.
    GiveUp,
}

impl RetryPolicy {
    /// Builds the policy for `delivery` against `endpoint`.
    pub fn for_delivery(endpoint: &Endpoint, delivery: &Delivery) -> Self {
        Self {
            max_attempts: delivery.max_attempts,
            base_delay: Duration::from_secs(u64::try_from(endpoint.retry_delay_seconds).unwrap_or(1)),
        }
    }

    /// Decides whether attempt `attempt_number`, which failed at `failed_at`,
    /// gets a successor.
    pub fn decide(&self, attempt_number: i32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = backoff_delay(self.base_delay, attempt_number);
        match chrono::Duration::from_std(delay).ok().and_then(|d| failed_at.checked_add_signed(d)) {
            Some(next_attempt_at) => RetryDecision::Retry { next_attempt_at },
            None => RetryDecision::GiveUp,
        }
    }
}

/// Backoff after the failed attempt `attempt_number` (1-based).
pub fn backoff_delay(base_delay: Duration, attempt_number: i32) -> Duration {
    let exponent = u32::try_from(attempt_number.saturating_sub(1)).unwrap_or(0);
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base_delay.saturating_mul(factor).min(MAX_BACKOFF)
}
