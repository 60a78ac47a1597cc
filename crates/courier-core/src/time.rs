//! Clock abstraction used for retry scheduling and suspension windows.
//!
//! Every timestamp the dispatcher and delivery engine persist comes from a
//! `Clock`, so tests can freeze and advance time instead of sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time, used for every persisted timestamp.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for measuring request durations.
    fn now(&self) -> Instant;

    /// Sleeps for `duration`.
    ///
    /// Worker poll loops sleep through this so a test clock can skip idle
    /// periods.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same time, so a clock handed to the engine can be
/// advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Wall-clock time as microseconds since the UNIX epoch.
    wall_micros: Arc<AtomicI64>,
    /// Monotonic offset from `base_instant` in microseconds.
    elapsed_micros: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a clock frozen at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock frozen at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            wall_micros: Arc::new(AtomicI64::new(start.timestamp_micros())),
            elapsed_micros: Arc::new(AtomicI64::new(0)),
            base_instant: Instant::now(),
        }
    }

    /// Moves both clocks forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.wall_micros.fetch_add(micros, Ordering::AcqRel);
        self.elapsed_micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Moves wall-clock time forward by a signed chrono duration.
    pub fn advance_by(&self, delta: chrono::Duration) {
        if let Ok(duration) = delta.to_std() {
            self.advance(duration);
        }
    }

    /// Sets wall-clock time; monotonic time only moves forward.
    pub fn set(&self, time: DateTime<Utc>) {
        let target = time.timestamp_micros();
        let current = self.wall_micros.swap(target, Ordering::AcqRel);
        if target > current {
            self.elapsed_micros.fetch_add(target - current, Ordering::AcqRel);
        }
    }

    /// Monotonic time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        let micros = self.elapsed_micros.load(Ordering::Acquire);
        Duration::from_micros(u64::try_from(micros).unwrap_or(0))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let micros = self.wall_micros.load(Ordering::Acquire);
        Utc.timestamp_micros(micros).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
