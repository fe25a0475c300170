//! Adaptive poll batch sizing.
//!
//! [`BackpressureController`] throttles how many records the runtime asks
//! for per poll. When processing or emit latency for a batch exceeds the
//! configured threshold, the requested batch size shrinks by a fixed
//! factor; when latency stays below the threshold the size doubles back
//! toward the configured maximum, reaching it within a bounded number of
//! cycles.

use std::time::Duration;

/// Controls the poll batch size based on observed batch latency.
#[derive(Debug)]
pub struct BackpressureController {
    /// Configured maximum batch size.
    max_batch: usize,
    /// Floor below which the batch size never shrinks.
    min_batch: usize,
    /// Latency above which to shrink.
    latency_threshold: Duration,
    /// Multiplier applied when shrinking (0.0-1.0).
    shrink_factor: f64,
    /// Current requested batch size.
    current: usize,
}

impl BackpressureController {
    /// Creates a controller starting at the maximum batch size.
    #[must_use]
    pub fn new(
        max_batch: usize,
        min_batch: usize,
        latency_threshold: Duration,
        shrink_factor: f64,
    ) -> Self {
        let min_batch = min_batch.max(1);
        Self {
            max_batch: max_batch.max(min_batch),
            min_batch,
            latency_threshold,
            shrink_factor: shrink_factor.clamp(0.01, 0.99),
            current: max_batch.max(min_batch),
        }
    }

    /// Returns the batch size the next poll should request.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.current
    }

    /// Returns `true` if the controller is currently throttled below the
    /// configured maximum.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.current < self.max_batch
    }

    /// Feeds the latency of one pull/process/emit cycle into the
    /// controller. An idle cycle (empty poll) should be reported with a
    /// zero latency so the batch size can recover.
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    pub fn observe(&mut self, batch_latency: Duration) {
        if batch_latency > self.latency_threshold {
            let shrunk = (self.current as f64 * self.shrink_factor) as usize;
            self.current = shrunk.max(self.min_batch);
        } else {
            self.current = self.current.saturating_mul(2).min(self.max_batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackpressureController {
        BackpressureController::new(1000, 10, Duration::from_millis(50), 0.5)
    }

    #[test]
    fn test_starts_at_max() {
        let ctrl = controller();
        assert_eq!(ctrl.batch_size(), 1000);
        assert!(!ctrl.is_throttled());
    }

    #[test]
    fn test_shrinks_on_slow_batch() {
        let mut ctrl = controller();
        ctrl.observe(Duration::from_millis(80));
        assert_eq!(ctrl.batch_size(), 500);
        assert!(ctrl.is_throttled());

        ctrl.observe(Duration::from_millis(80));
        assert_eq!(ctrl.batch_size(), 250);
    }

    #[test]
    fn test_never_shrinks_below_floor() {
        let mut ctrl = controller();
        for _ in 0..32 {
            ctrl.observe(Duration::from_secs(1));
        }
        assert_eq!(ctrl.batch_size(), 10);
    }

    #[test]
    fn test_recovers_within_bounded_cycles() {
        let mut ctrl = controller();
        for _ in 0..32 {
            ctrl.observe(Duration::from_secs(1));
        }
        assert_eq!(ctrl.batch_size(), 10);

        // Doubling from the floor of 10 reaches 1000 in seven fast cycles.
        let mut cycles = 0;
        while ctrl.is_throttled() {
            ctrl.observe(Duration::ZERO);
            cycles += 1;
            assert!(cycles <= 7, "batch size failed to recover");
        }
        assert_eq!(ctrl.batch_size(), 1000);
    }

    #[test]
    fn test_latency_at_threshold_does_not_shrink() {
        let mut ctrl = controller();
        ctrl.observe(Duration::from_millis(50));
        assert_eq!(ctrl.batch_size(), 1000);
    }
}
