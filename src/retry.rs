//! Retry policies with exponential backoff.
//!
//! Shared by the offset committer (commit retries) and the processing
//! stage (per-record retry before dead-lettering).

use std::time::Duration;

/// Retry policy configuration.
///
/// Supports exponential backoff with optional jitter to prevent
/// thundering herd.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Maximum delay between retries.
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for doubling).
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0) to randomize delays.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Creates a simple exponential backoff policy.
    ///
    /// Uses a multiplier of 2.0, a 60 second cap, and 10% jitter.
    #[must_use]
    pub fn exponential(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Creates a fixed-interval policy (no backoff growth).
    #[must_use]
    pub fn fixed(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Caps the backoff at `max`.
    #[must_use]
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Returns `true` if another attempt is allowed after `attempts`
    /// completed attempts.
    #[must_use]
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay before the retry following attempt number
    /// `attempt` (1-based; attempt 0 has no delay).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // attempt count is always small
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt as i32).saturating_sub(1);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let clamped = base.min(self.max_backoff.as_secs_f64());

        // Deterministic jitter keeps delays reproducible in tests.
        let jitter_offset = if self.jitter > 0.0 {
            let pseudo_random = ((attempt as f64 * 0.618_033_988_749_895) % 1.0) * 2.0 - 1.0;
            clamped * self.jitter * pseudo_random
        } else {
            0.0
        };

        Duration::from_secs_f64((clamped + jitter_offset).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100))
    }
}
