//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed Tasks.
///
/// `backoff(n) = min(max_delay, base_delay * multiplier^n) * (1 ± jitter_fraction)`,
/// clamped to `[0, max_delay]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,

    /// Upper bound on any delay.
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Relative jitter applied symmetrically around the nominal delay.
    pub jitter_fraction: f64,

    /// Failures tolerated before the Task is given up.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            multiplier: 2.0,
            jitter_fraction: 0.2,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay without jitter for the `retry_count`-th retry.
    ///
    /// Example with base_delay=30s, multiplier=2.0, max_delay=30min:
    /// - retry 0: 30s
    /// - retry 1: 60s
    /// - retry 2: 120s
    /// - retry 7 and later: 30min (capped)
    pub fn nominal_delay(&self, retry_count: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64();
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs.max(0.0))
        }
    }

    /// Jittered delay for the `retry_count`-th retry.
    pub fn backoff<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let (lo, hi) = self.delay_bounds(retry_count);
        if hi <= lo {
            return lo;
        }
        let secs = rng.gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
        Duration::from_secs_f64(secs).clamp(lo, hi)
    }

    /// Inclusive range that `backoff(retry_count)` draws from.
    pub fn delay_bounds(&self, retry_count: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(retry_count).as_secs_f64();
        let jitter = if self.jitter_fraction.is_finite() {
            self.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let max_secs = self.max_delay.as_secs_f64();
        let lo = (nominal * (1.0 - jitter)).clamp(0.0, max_secs);
        let hi = (nominal * (1.0 + jitter)).clamp(0.0, max_secs);
        (Duration::from_secs_f64(lo), Duration::from_secs_f64(hi))
    }
}
