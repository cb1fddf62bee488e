//! Transfer speed, ETA and progress-event throttling.
//!
//! Speed is a moving average over a sliding window of recent byte samples,
//! so a burst at the start of a transfer does not dominate the estimate and
//! a stall shows up quickly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default span of history the speed estimate considers.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Default minimum gap between progress events for one job.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Hard cap on retained samples.
const MAX_SAMPLES: usize = 256;

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    /// When the sample was recorded.
    timestamp: Instant,
    /// Cumulative bytes transferred at that moment.
    total_bytes: u64,
}

/// Sliding-window transfer speed estimator.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window: Duration,
    max_samples: usize,
}

impl SpeedTracker {
    /// Create a tracker over the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(32),
            window,
            max_samples: MAX_SAMPLES,
        }
    }

    /// Record the cumulative byte count at `at`.
    pub fn record(&mut self, at: Instant, total_bytes: u64) {
        self.samples.push_back(SpeedSample {
            timestamp: at,
            total_bytes,
        });
        self.prune(at);
    }

    fn prune(&mut self, now: Instant) {
        // Keep at least two samples so a slow trickle still yields a rate.
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(oldest) if now.saturating_duration_since(oldest.timestamp) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Bytes per second across the retained window. Zero with fewer than two
    /// samples.
    pub fn bytes_per_sec(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.saturating_duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        let bytes = last.total_bytes.saturating_sub(first.total_bytes);
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Forget all samples. Used across pauses so idle time does not drag the
    /// average down.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }
}

/// Seconds to finish `remaining_bytes` at `bytes_per_sec`.
///
/// Unknown (not infinite, not zero) while the speed is zero.
pub fn estimate_eta(remaining_bytes: u64, bytes_per_sec: f64) -> Option<u64> {
    if bytes_per_sec <= 0.0 || !bytes_per_sec.is_finite() {
        return None;
    }
    Some((remaining_bytes as f64 / bytes_per_sec).ceil() as u64)
}

/// Rate limiter for progress events.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    /// Allow at most one event per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Whether an event may be emitted at `now`. Records the emission when
    /// it returns `true`.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    /// Record an emission that bypassed the throttle.
    pub fn mark(&mut self, now: Instant) {
        self.last_emit = Some(now);
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_speed_needs_two_samples() {
        let mut tracker = SpeedTracker::default();
        assert_eq!(tracker.bytes_per_sec(), 0.0);

        tracker.record(Instant::now(), 1000);
        assert_eq!(tracker.bytes_per_sec(), 0.0);
    }

    #[test]
    fn test_speed_over_window() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new(Duration::from_secs(10));

        tracker.record(start, 0);
        tracker.record(start + Duration::from_secs(1), 1_000);
        tracker.record(start + Duration::from_secs(2), 2_000);

        assert!((tracker.bytes_per_sec() - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_old_samples_fall_out_of_window() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new(Duration::from_secs(2));

        // Fast burst, then a slow tail.
        tracker.record(start, 0);
        tracker.record(start + Duration::from_secs(1), 10_000);
        tracker.record(start + Duration::from_secs(5), 10_100);
        tracker.record(start + Duration::from_secs(6), 10_200);

        // Only the tail remains: 100 bytes/s.
        assert!((tracker.bytes_per_sec() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_cap() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new(Duration::from_secs(3600));
        for i in 0..(MAX_SAMPLES as u64 + 50) {
            tracker.record(start + Duration::from_millis(i), i);
        }
        assert_eq!(tracker.sample_count(), MAX_SAMPLES);
    }

    #[test]
    fn test_reset_zeroes_speed() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::default();
        tracker.record(start, 0);
        tracker.record(start + Duration::from_secs(1), 500);
        tracker.reset();
        assert_eq!(tracker.bytes_per_sec(), 0.0);
    }

    #[test]
    fn test_eta_unknown_at_zero_speed() {
        assert_eq!(estimate_eta(1000, 0.0), None);
        assert_eq!(estimate_eta(1000, 100.0), Some(10));
        assert_eq!(estimate_eta(1001, 100.0), Some(11));
        assert_eq!(estimate_eta(0, 100.0), Some(0));
    }

    #[test]
    fn test_throttle() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));

        assert!(throttle.should_emit(start));
        assert!(!throttle.should_emit(start + Duration::from_millis(50)));
        assert!(!throttle.should_emit(start + Duration::from_millis(199)));
        assert!(throttle.should_emit(start + Duration::from_millis(200)));

        throttle.mark(start + Duration::from_millis(300));
        assert!(!throttle.should_emit(start + Duration::from_millis(350)));
    }

    proptest! {
        #[test]
        fn prop_speed_is_bounded_and_finite(
            steps in proptest::collection::vec((1u64..500, 0u64..100_000), 1..600)
        ) {
            let start = Instant::now();
            let mut tracker = SpeedTracker::new(Duration::from_secs(2));
            let mut elapsed_ms = 0;
            let mut total = 0;
            let mut fastest = 0.0f64;

            tracker.record(start, 0);
            for (gap_ms, bytes) in steps {
                elapsed_ms += gap_ms;
                total += bytes;
                fastest = fastest.max(bytes as f64 / (gap_ms as f64 / 1000.0));
                tracker.record(start + Duration::from_millis(elapsed_ms), total);

                let speed = tracker.bytes_per_sec();
                prop_assert!(speed.is_finite());
                prop_assert!(speed >= 0.0);
                prop_assert!(speed <= fastest + 1e-6);
                prop_assert!(tracker.sample_count() <= MAX_SAMPLES);
            }
        }
    }
}
