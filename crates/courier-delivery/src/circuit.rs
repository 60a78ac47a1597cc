//! Per-endpoint circuit breaker.
//!
//! Breaker state lives on the endpoint row so every worker sees the same
//! decision; this module only decides what a worker should do with that
//! state and how to read the result of an atomic health update.
//!
//! # State Machine
//!
//! ```text
//!   ┌────────────┐  consecutive_failures ≥ threshold   ┌─────────────────────┐
//!   │   ACTIVE   │ ──────────────────────────────────▶ │      SUSPENDED      │
//!   │            │                                     │ until now+cooldown  │
//!   │ calls made │ ◀────────────────────────────────── │ calls short-circuit │
//!   └────────────┘   next success, or reactivate       └─────────────────────┘
//!                                                        │ cooldown elapsed:
//!                                                        │ trial call allowed,
//!                                                        ▼ failure re-suspends
//! ```
//!
//! `inactive` and `failed` are operator states and never change here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{Endpoint, EndpointAvailability, EndpointHealth, EndpointStatus};

/// Default suspension window after the breaker trips.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Breaker configuration shared by all endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    /// How long a tripped endpoint stays suspended.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { cooldown: DEFAULT_COOLDOWN }
    }
}

/// What a worker may do with an endpoint right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Make the call. `trial` is set when probing a suspended endpoint whose
    /// cooldown has elapsed.
    Allow {
        /// Probing a suspended endpoint.
        trial: bool,
    },
    /// Fail the attempt without a network call.
    ShortCircuit {
        /// End of the current cooldown.
        until: DateTime<Utc>,
    },
    /// The endpoint is disabled; cancel the delivery.
    Reject(EndpointStatus),
}

/// Change observed after an atomic health update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status did not change.
    Unchanged,
    /// The endpoint was suspended by this failure.
    Tripped {
        /// End of the new cooldown.
        until: DateTime<Utc>,
    },
    /// A success lifted a suspension.
    Reactivated,
}

/// Stateless breaker policy over persisted endpoint health.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreaker {
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration.
    pub fn new(config: CircuitConfig) -> Self {
        Self { config }
    }

    /// Configured cooldown.
    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }

    /// Decides whether `endpoint` may be called at `now`.
    pub fn admit(&self, endpoint: &Endpoint, now: DateTime<Utc>) -> Admission {
        match endpoint.availability(now) {
            EndpointAvailability::Available => {
                Admission::Allow { trial: endpoint.status == EndpointStatus::Suspended }
            },
            EndpointAvailability::Suspended { until } => Admission::ShortCircuit { until },
            EndpointAvailability::Disabled(status) => Admission::Reject(status),
        }
    }

    /// Suspension deadline to apply if a failure at `now` trips the breaker.
    pub fn trip_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.cooldown)
            .ok()
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Reads the transition caused by a failure recorded with `trip_until`.
    pub fn after_failure(trip_until: Option<DateTime<Utc>>, after: &EndpointHealth) -> Transition {
        match (trip_until, after.status, after.suspended_until) {
            (Some(requested), EndpointStatus::Suspended, Some(until))
                if (until - requested).abs() < chrono::Duration::milliseconds(1) =>
            {
                Transition::Tripped { until }
            },
            _ => Transition::Unchanged,
        }
    }

    /// Reads the transition caused by a success.
    pub fn after_success(before: EndpointStatus, after: &EndpointHealth) -> Transition {
        if before == EndpointStatus::Suspended && after.status == EndpointStatus::Active {
            Transition::Reactivated
        } else {
            Transition::Unchanged
        }
    }
}
