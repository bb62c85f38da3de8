//! Retry policy for machine creation.
//!
//! Delay after failed attempt `n` (1-indexed) is
//! `min(initial_delay * multiplier^(n-1), max_delay)` plus, when jitter is on,
//! a uniform random extra of up to a quarter of that base.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Upper bound for a single create call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        let base_ms = if base_ms.is_nan() || base_ms < 0.0 {
            0.0
        } else {
            base_ms.min(max_ms)
        };
        let base = base_ms as u64;

        let extra = if self.jitter && base >= 4 {
            rand::rng().random_range(0..=base / 4)
        } else {
            0
        };

        Duration::from_millis(base + extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_eight_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts, 8);
    }

    #[test]
    fn delay_grows_then_clamps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::default();
        for attempt in 1..=8 {
            let base = RetryPolicy {
                jitter: false,
                ..policy.clone()
            }
            .delay_for(attempt);
            let jittered = policy.delay_for(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base / 4);
        }
    }

    #[test]
    fn immediate_never_waits() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }
}
