//! Time sources used by the trace and collector pipelines.
//!
//! Two distinct notions of time are kept apart on purpose:
//! - [`Ticker`] is a monotonic nanosecond counter used for durations on the
//!   instrumentation hot path. It never goes backwards and has no relation
//!   to calendar time.
//! - [`Clock`] is wall-clock milliseconds since the Unix epoch, used only to
//!   stamp completed traces and align aggregation windows.
//!
//! Both are trait objects so tests can drive them deterministically; see
//! [`ManualTicker`] and [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond time source.
///
/// Reading the ticker is on the hot path of every instrumented call, so
/// implementations must be cheap and must never block.
pub trait Ticker: Send + Sync {
    /// Current reading in nanoseconds. Only differences between readings
    /// are meaningful.
    fn now(&self) -> i64;
}

/// Wall-clock time source in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in milliseconds.
    fn now_millis(&self) -> i64;
}

/// [`Ticker`] backed by [`Instant`], anchored at construction time.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    /// Creates a ticker whose readings start near zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> i64 {
        // i64 nanoseconds overflow after ~292 years of process uptime
        self.origin.elapsed().as_nanos() as i64
    }
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced [`Ticker`] for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualTicker {
    now: AtomicI64,
}

impl ManualTicker {
    /// Creates a ticker starting at the given reading.
    #[must_use]
    pub fn starting_at(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Advances the current reading by `nanos`.
    pub fn advance(&self, nanos: i64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Ticker for ManualTicker {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Manually advanced [`Clock`] for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock starting at the given wall-clock millisecond value.
    #[must_use]
    pub fn starting_at(now_millis: i64) -> Self {
        Self {
            now_millis: AtomicI64::new(now_millis),
        }
    }

    /// Sets the current wall-clock time.
    pub fn set_millis(&self, now_millis: i64) {
        self.now_millis.store(now_millis, Ordering::SeqCst);
    }

    /// Advances the current wall-clock time by `millis`.
    pub fn advance_millis(&self, millis: i64) {
        self.now_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_ticker_is_monotonic() {
        let ticker = SystemTicker::new();
        let a = ticker.now();
        let b = ticker.now();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn system_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z in epoch millis
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn manual_ticker_set_and_advance() {
        let ticker = ManualTicker::starting_at(100);
        assert_eq!(ticker.now(), 100);
        ticker.advance(50);
        assert_eq!(ticker.now(), 150);
        ticker.set(42);
        assert_eq!(ticker.now(), 42);
    }

    #[test]
    fn manual_clock_set_and_advance() {
        let clock = ManualClock::starting_at(5);
        assert_eq!(clock.now_millis(), 5);
        clock.advance_millis(7);
        assert_eq!(clock.now_millis(), 12);
        clock.set_millis(1000);
        assert_eq!(clock.now_millis(), 1000);
    }
}
