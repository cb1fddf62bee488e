//! Injectable time source.
//!
//! Services never call `Utc::now()` or `Instant::now()` directly; they ask a
//! [`Clock`]. Production code uses [`SystemClock`], tests use [`ManualClock`]
//! to drive speed and ETA calculations deterministically.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time, used for persisted timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for rate calculations.
    fn instant(&self) -> Instant;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_time: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current moment.
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_time: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.base_time + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }

    fn instant(&self) -> Instant {
        self.base_instant + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_sources() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        let i0 = clock.instant();

        clock.advance(Duration::from_secs(3));

        assert_eq!((clock.now() - t0).num_seconds(), 3);
        assert_eq!(clock.instant() - i0, Duration::from_secs(3));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.instant();
        let b = clock.instant();
        assert!(b >= a);
    }
}
