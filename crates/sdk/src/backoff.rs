//! Retry policy with jittered exponential back-off.

use std::time::Duration;

/// Delay schedule between "no responders" retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Upper bound of the random extra delay, as a fraction of the base.
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(20))
    }
}

impl RetryBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: 2.0,
            jitter: 0.10,
        }
    }

    /// Capped delay for `attempt` (0-indexed), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Delay for `attempt` with up to `jitter` extra.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, random_fraction())
    }

    /// Same as [`delay_for_attempt`](Self::delay_for_attempt) with an
    /// explicit fraction in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let base = self.base_delay(attempt);
        let extra = base.as_secs_f64() * self.jitter * fraction.clamp(0.0, 1.0);
        base + Duration::from_secs_f64(extra)
    }
}

/// Uniform fraction in `[0, 1)` taken from the random bits of a v4 UUID.
fn random_fraction() -> f64 {
    const MANTISSA: u64 = (1 << 53) - 1;
    let (_, low) = uuid::Uuid::new_v4().as_u64_pair();
    (low & MANTISSA) as f64 / (1u64 << 53) as f64
}
