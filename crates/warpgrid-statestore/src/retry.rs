//! Retry backoff strategies.
//!
//! A [`BackoffStrategy`] is a pure function from attempt number to delay.
//! Randomness comes from an injected [`JitterSource`] so the curve can be
//! tested deterministically with [`FixedJitter`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;

/// Upper bound on any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Source of uniformly distributed fractions in `[0, 1)`.
pub trait JitterSource: Send + Sync + std::fmt::Debug {
    fn fraction(&self) -> f64;
}

/// Jitter drawn from the operating system RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsJitter;

impl JitterSource for OsJitter {
    fn fraction(&self) -> f64 {
        let mut buf = [0u8; 8];
        if getrandom::getrandom(&mut buf).is_err() {
            return 0.0;
        }
        // Top 53 bits give a uniform f64 mantissa.
        (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Constant jitter, for tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn fraction(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Maps a 1-based attempt number to the sleep before the next attempt.
pub trait BackoffStrategy: Send + Sync + std::fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `base * (attempt² + 1)` plus up to `base / 2` of jitter, capped at `max`.
#[derive(Clone, Debug)]
pub struct QuadraticBackoff {
    base: Duration,
    max: Duration,
    jitter: Arc<dyn JitterSource>,
}

impl QuadraticBackoff {
    pub fn new(base: Duration, jitter: Arc<dyn JitterSource>) -> Self {
        Self {
            base,
            max: MAX_BACKOFF,
            jitter,
        }
    }

    pub fn with_max(self, max: Duration) -> Self {
        Self { max, ..self }
    }
}

impl BackoffStrategy for QuadraticBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = attempt.saturating_mul(attempt).saturating_add(1);
        let curve = self.base.saturating_mul(factor);
        let jitter = self.base.mul_f64(0.5 * self.jitter.fraction());
        curve.saturating_add(jitter).min(self.max)
    }
}

/// Attempt budget plus the strategy that spaces attempts out.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Build the default jittered policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Arc::new(QuadraticBackoff::new(config.base_delay, Arc::new(OsJitter))),
        )
    }
}
