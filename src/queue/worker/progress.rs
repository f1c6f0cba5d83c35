//! Progress persistence throttling and transfer rate smoothing

use crate::config::ProgressConfig;
use std::time::{Duration, Instant};

/// Decides when a progress update is worth a store write
///
/// A write happens only once both the byte step and the time step have been
/// exceeded since the last write.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    min_step_bytes: i64,
    min_interval: Duration,
    last_bytes: i64,
    last_at: Instant,
}

impl ProgressThrottle {
    pub(crate) fn new(config: &ProgressConfig, start_bytes: i64, now: Instant) -> Self {
        Self {
            min_step_bytes: i64::try_from(config.min_step_bytes).unwrap_or(i64::MAX),
            min_interval: config.min_interval,
            last_bytes: start_bytes,
            last_at: now,
        }
    }

    pub(crate) fn should_persist(&self, bytes: i64, now: Instant) -> bool {
        bytes.saturating_sub(self.last_bytes) > self.min_step_bytes
            && now.saturating_duration_since(self.last_at) > self.min_interval
    }

    pub(crate) fn mark(&mut self, bytes: i64, now: Instant) {
        self.last_bytes = bytes;
        self.last_at = now;
    }
}

/// Exponentially smoothed bytes-per-second estimate
///
/// Each sample window must be longer than the configured interval. The first
/// completed window seeds the estimate; later ones are blended 3:1 with it.
#[derive(Debug)]
pub(crate) struct RateEstimator {
    interval: Duration,
    sample_at: Instant,
    sample_bytes: i64,
    speed: u64,
}

impl RateEstimator {
    pub(crate) fn new(interval: Duration, start_bytes: i64, now: Instant) -> Self {
        Self {
            interval,
            sample_at: now,
            sample_bytes: start_bytes,
            speed: 0,
        }
    }

    /// Feed the running byte count; returns a new estimate when a window closes
    pub(crate) fn sample(&mut self, bytes: i64, now: Instant) -> Option<u64> {
        let elapsed = now.saturating_duration_since(self.sample_at);
        if elapsed <= self.interval || elapsed.is_zero() {
            return None;
        }

        let delta = u128::try_from(bytes.saturating_sub(self.sample_bytes)).unwrap_or(0);
        let sample = u64::try_from(delta * 1000 / elapsed.as_millis().max(1)).unwrap_or(u64::MAX);
        self.speed = if self.speed == 0 {
            sample
        } else {
            (self.speed.saturating_mul(3) / 4).saturating_add(sample / 4)
        };

        self.sample_at = now;
        self.sample_bytes = bytes;
        Some(self.speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(step: u64, interval_ms: u64) -> ProgressConfig {
        ProgressConfig {
            min_step_bytes: step,
            min_interval: Duration::from_millis(interval_ms),
            ..ProgressConfig::default()
        }
    }

    #[test]
    fn throttle_needs_both_bytes_and_time() {
        let start = Instant::now();
        let throttle = ProgressThrottle::new(&config(1000, 100), 0, start);

        // enough bytes, not enough time
        assert!(!throttle.should_persist(5000, start + Duration::from_millis(50)));
        // enough time, not enough bytes
        assert!(!throttle.should_persist(1000, start + Duration::from_millis(500)));
        // both
        assert!(throttle.should_persist(1001, start + Duration::from_millis(101)));
    }

    #[test]
    fn throttle_measures_from_last_write() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(&config(10, 10), 0, start);
        let later = start + Duration::from_millis(20);
        assert!(throttle.should_persist(50, later));

        throttle.mark(50, later);
        assert!(!throttle.should_persist(55, later + Duration::from_millis(20)));
        assert!(throttle.should_persist(61, later + Duration::from_millis(20)));
    }

    #[test]
    fn rate_waits_for_a_full_window() {
        let start = Instant::now();
        let mut rate = RateEstimator::new(Duration::from_millis(500), 0, start);
        assert_eq!(rate.sample(4096, start + Duration::from_millis(400)), None);
        assert_eq!(rate.sample(4096, start + Duration::from_millis(500)), None);
        assert_eq!(
            rate.sample(10_000, start + Duration::from_millis(1000)),
            Some(10_000)
        );
    }

    #[test]
    fn rate_blends_new_samples() {
        let start = Instant::now();
        let mut rate = RateEstimator::new(Duration::from_millis(500), 0, start);
        let first = start + Duration::from_secs(1);
        assert_eq!(rate.sample(4000, first), Some(4000));
        // 0 bytes in the next second pulls the estimate down by a quarter
        assert_eq!(rate.sample(4000, first + Duration::from_secs(1)), Some(3000));
    }
}
