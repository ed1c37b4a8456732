//! Time utilities for pgbroker
//!
//! Provides wall-clock helpers and the [`Clock`] abstraction injected into
//! the session manager so idle tracking can be driven from tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system time is before the Unix epoch.
///
/// # Examples
/// ```
/// use pgb_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get the current Unix timestamp in nanoseconds.
///
/// Returns 0 if the system time is before the Unix epoch.
pub fn current_time_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Elapsed time between two nanosecond timestamps.
///
/// Returns Duration::ZERO if `since` lies after `now`.
pub fn elapsed_between(now_nanos: u64, since_nanos: u64) -> Duration {
    Duration::from_nanos(now_nanos.saturating_sub(since_nanos))
}

/// Source of "now" for idle tracking
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time as Unix nanoseconds
    fn now_nanos(&self) -> u64;

    /// Current time as Unix milliseconds
    fn now_millis(&self) -> u64 {
        self.now_nanos() / NANOS_PER_MILLI
    }
}

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Clock backed by the system wall clock.
///
/// Readings are strictly increasing across the whole process, so any two
/// consecutive readings are at least one nanosecond apart.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        static LAST: AtomicU64 = AtomicU64::new(0);

        let wall = current_time_nanos();
        let prev = LAST
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(wall.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        wall.max(prev + 1)
    }
}

/// Manually advanced clock, for deterministic idle tests
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the given Unix milliseconds
    pub fn new(start_millis: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_millis * NANOS_PER_MILLI),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp in Unix milliseconds
    pub fn set(&self, millis: u64) {
        self.nanos.store(millis * NANOS_PER_MILLI, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_elapsed_between() {
        assert_eq!(elapsed_between(1_500, 1_000), Duration::from_nanos(500));
    }

    #[test]
    fn test_elapsed_between_future_time() {
        assert_eq!(elapsed_between(1_000, 5_000), Duration::ZERO);
    }

    #[test]
    fn test_manual_clock_advance_and_set() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);

        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_millis();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now_millis() >= a);
    }

    #[test]
    fn test_system_clock_never_repeats() {
        let clock = SystemClock;
        let mut last = clock.now_nanos();
        for _ in 0..10_000 {
            let now = clock.now_nanos();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_system_clock_is_unix_time() {
        let millis = SystemClock.now_millis();
        assert!(millis.abs_diff(current_time_millis()) < 1_000);
    }

    #[test]
    fn test_manual_clock_sub_millisecond_advance() {
        let clock = ManualClock::new(1);
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.now_nanos(), 1_001_000);
        assert_eq!(clock.now_millis(), 1);
    }
}
