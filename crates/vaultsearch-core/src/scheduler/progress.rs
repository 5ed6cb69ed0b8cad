//! Progress reporting and remaining-time estimation.

use std::time::Duration;

/// Snapshot of indexing progress, published after every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexingProgress {
    /// Messages processed so far, including skipped ones.
    pub processed: u64,
    /// Best known number of messages to process.
    pub total_estimate: u64,
    /// Remaining time, once enough items were timed.
    pub estimated_time_remaining: Option<Duration>,
}

impl IndexingProgress {
    /// Messages left to process.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.total_estimate.saturating_sub(self.processed)
    }
}

/// Estimates the remaining time from an exponentially weighted average of
/// per-message durations.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    smoothing: f64,
    warmup: u32,
    samples: u32,
    average_secs: f64,
}

impl EtaEstimator {
    /// Creates an estimator.
    ///
    /// `smoothing` is the weight of the newest sample and is clamped to
    /// `(0, 1]`; no estimate is made before `warmup` samples were recorded.
    #[must_use]
    pub fn new(smoothing: f64, warmup: u32) -> Self {
        let smoothing = if smoothing.is_finite() && smoothing > 0.0 {
            smoothing.min(1.0)
        } else {
            1.0
        };
        Self {
            smoothing,
            warmup: warmup.max(1),
            samples: 0,
            average_secs: 0.0,
        }
    }

    /// Record how long one message took.
    pub fn record(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        self.average_secs = if self.samples == 0 {
            sample
        } else {
            self.smoothing.mul_add(sample - self.average_secs, self.average_secs)
        };
        self.samples = self.samples.saturating_add(1);
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        self.samples = 0;
        self.average_secs = 0.0;
    }

    /// Remaining time for `remaining` messages.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self, remaining: u64) -> Option<Duration> {
        if self.samples < self.warmup {
            return None;
        }
        let secs = (self.average_secs * remaining as f64).max(0.0);
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_no_estimate_during_warmup() {
        let mut eta = EtaEstimator::new(0.2, 3);
        eta.record(Duration::from_millis(100));
        eta.record(Duration::from_millis(100));
        assert_eq!(eta.estimate(10), None);

        eta.record(Duration::from_millis(100));
        assert_eq!(eta.estimate(10), Some(Duration::from_secs(1)));
        assert_eq!(eta.estimate(0), Some(Duration::ZERO));
    }

    #[test]
    fn test_outlier_is_smoothed() {
        let mut eta = EtaEstimator::new(0.2, 1);
        for _ in 0..10 {
            eta.record(Duration::from_millis(100));
        }
        eta.record(Duration::from_secs(10));

        let estimate = eta.estimate(1).unwrap();
        assert!(estimate < Duration::from_secs(3));
        assert!(estimate > Duration::from_millis(100));
    }

    #[test]
    fn test_reset() {
        let mut eta = EtaEstimator::new(0.5, 1);
        eta.record(Duration::from_secs(1));
        eta.reset();
        assert_eq!(eta.estimate(5), None);
    }

    proptest! {
        #[test]
        fn estimate_is_bounded_by_slowest_sample(
            samples in prop::collection::vec(0u64..5_000, 1..50),
            remaining in 0u64..100_000,
            smoothing in 0.01f64..1.0,
        ) {
            let mut eta = EtaEstimator::new(smoothing, 1);
            for ms in &samples {
                eta.record(Duration::from_millis(*ms));
            }
            let slowest = Duration::from_millis(*samples.iter().max().unwrap());
            let bound = slowest.as_secs_f64() * remaining as f64;

            let estimate = eta.estimate(remaining).unwrap();
            prop_assert!(estimate.as_secs_f64() <= bound * (1.0 + 1e-9) + 1e-6);
        }
    }
}
