//! Reconnection policy: exponential backoff with jitter.
//!
//! Attempt `n` (1-indexed) waits `min(base_delay * 2^(n-1), max_delay)`,
//! scaled by a random factor in `1 ± jitter_fraction` and clamped to
//! `[0, max_delay]`. The policy is stateless; callers count attempts.

use rand::Rng;
use std::time::Duration;

/// Default delay before the first attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter fraction.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Default number of attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// In `[0, 1]`; values outside are clamped and NaN or infinity means none.
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Policy without jitter, handy for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_fraction = 0.0;
        self
    }

    /// Un-jittered delay for attempt `attempt` (1-indexed; 0 is treated as 1).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay for attempt `attempt` with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_fraction.is_finite() {
            self.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return self.delay_for_attempt(attempt);
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        self.scaled(attempt, scale)
    }

    /// Apply a jitter scale factor to the base schedule, clamped to `[0, max_delay]`.
    fn scaled(&self, attempt: u32, scale: f64) -> Duration {
        let secs = self.delay_for_attempt(attempt).as_secs_f64() * scale.max(0.0);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    /// True once `failed_attempts` consecutive failures reach `max_attempts`.
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }

    /// Validate policy values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("reconnect max_attempts must be at least 1".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "reconnect base_delay ({:?}) cannot exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(format!(
                "reconnect jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        Ok(())
    }
}
