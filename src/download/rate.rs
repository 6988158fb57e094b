//! Sliding-window transfer rate.
//!
//! [`RateEstimator`] keeps one byte counter per second for the last
//! [`RATE_WINDOW_BUCKETS`] seconds and reports the average over the
//! seconds actually observed, so a fresh download reports a sensible rate
//! before the window has filled.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::constants::RATE_WINDOW_BUCKETS;

const BUCKET_WIDTH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateEstimator {
    started: Option<Instant>,
    // (bucket index since start, bytes)
    buckets: VecDeque<(u64, u64)>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: None,
            buckets: VecDeque::with_capacity(RATE_WINDOW_BUCKETS),
        }
    }

    /// Records `bytes` received at `now`.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        let started = *self.started.get_or_insert(now);
        let index = bucket_index(started, now);
        match self.buckets.back_mut() {
            Some((last, total)) if *last == index => *total += bytes,
            _ => self.buckets.push_back((index, bytes)),
        }
        self.evict(index);
    }

    /// Average bytes per second over the window ending at `now`.
    #[must_use]
    pub fn bytes_per_sec(&self, now: Instant) -> u64 {
        let Some(started) = self.started else {
            return 0;
        };
        let current = bucket_index(started, now);
        let window = RATE_WINDOW_BUCKETS as u64;
        let oldest = current.saturating_sub(window - 1);
        let total: u64 = self
            .buckets
            .iter()
            .filter(|(index, _)| *index >= oldest)
            .map(|(_, bytes)| bytes)
            .sum();
        let seconds = (current - oldest + 1).min(window);
        total / seconds
    }

    fn evict(&mut self, current: u64) {
        let oldest = current.saturating_sub(RATE_WINDOW_BUCKETS as u64 - 1);
        while self
            .buckets
            .front()
            .is_some_and(|(index, _)| *index < oldest)
        {
            self.buckets.pop_front();
        }
    }
}

fn bucket_index(started: Instant, now: Instant) -> u64 {
    let elapsed = now.saturating_duration_since(started);
    elapsed.as_secs() / BUCKET_WIDTH.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_estimator_reports_zero() {
        assert_eq!(RateEstimator::new().bytes_per_sec(Instant::now()), 0);
    }

    #[test]
    fn test_rate_within_first_second() {
        let start = Instant::now();
        let mut rate = RateEstimator::new();
        rate.record(500, start);
        rate.record(500, start + Duration::from_millis(300));
        assert_eq!(rate.bytes_per_sec(start + Duration::from_millis(900)), 1000);
    }

    #[test]
    fn test_rate_averages_observed_seconds() {
        let start = Instant::now();
        let mut rate = RateEstimator::new();
        rate.record(1000, start);
        rate.record(3000, start + Duration::from_secs(1));
        assert_eq!(rate.bytes_per_sec(start + Duration::from_millis(1500)), 2000);
    }

    #[test]
    fn test_old_buckets_fall_out_of_window() {
        let start = Instant::now();
        let mut rate = RateEstimator::new();
        rate.record(10_000, start);
        rate.record(100, start + Duration::from_secs(20));
        // Only the most recent bucket is inside the 10 second window.
        assert_eq!(rate.bytes_per_sec(start + Duration::from_secs(20)), 10);
    }

    #[test]
    fn test_idle_time_lowers_rate() {
        let start = Instant::now();
        let mut rate = RateEstimator::new();
        for second in 0..10 {
            rate.record(100, start + Duration::from_secs(second));
        }
        assert_eq!(rate.bytes_per_sec(start + Duration::from_secs(9)), 100);
        assert_eq!(rate.bytes_per_sec(start + Duration::from_secs(14)), 50);
    }
}
