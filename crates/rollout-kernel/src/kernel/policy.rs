//! Retry policy for node task attempts.
//!
//! **Retry loop:** the phase executor asks `decide` after every failed attempt and stops
//! retrying once the policy returns `Fail`. `attempt` is the 0-based count of failures so far,
//! so a policy with `max_retries = 2` allows three executions in total.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decision after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfterMs(u64),
    Fail,
}

/// Exponential backoff: `min(cap, base * 2^attempt)` plus deterministic jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: Option<u64>,
    /// Jitter ratio in [0.0, 1.0].
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_base_ms: backoff_ms,
            backoff_cap_ms: Some(backoff_ms),
            jitter_ratio: 0.0,
        }
    }

    pub fn with_exponential_backoff(
        max_retries: u32,
        backoff_base_ms: u64,
        backoff_cap_ms: Option<u64>,
        jitter_ratio: f64,
    ) -> Self {
        Self {
            max_retries,
            backoff_base_ms,
            backoff_cap_ms,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Never retries.
    pub fn no_retry() -> Self {
        Self::new(0, 0)
    }

    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::RetryAfterMs(self.delay_ms(attempt))
        } else {
            RetryDecision::Fail
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = self
            .backoff_base_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped = match self.backoff_cap_ms {
            Some(cap) => exp.min(cap),
            None => exp,
        };
        if self.jitter_ratio <= 0.0 {
            return capped;
        }
        // Deterministic jitter keyed on the attempt; no rand dependency.
        let jitter_factor = (attempt.wrapping_mul(31) % 100) as f64 / 100.0;
        let jitter = capped as f64 * self.jitter_ratio * jitter_factor;
        (capped as f64 + jitter) as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_exponential_backoff(2, 200, Some(10_000), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_max_then_fails() {
        let policy = RetryPolicy::new(2, 10);
        assert_eq!(policy.decide(0), RetryDecision::RetryAfterMs(10));
        assert_eq!(policy.decide(1), RetryDecision::RetryAfterMs(10));
        assert_eq!(policy.decide(2), RetryDecision::Fail);
        assert_eq!(RetryPolicy::no_retry().decide(0), RetryDecision::Fail);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy::with_exponential_backoff(10, 50, Some(300), 0.0);
        let delays: Vec<u64> = (0..5).map(|a| policy.delay_ms(a)).collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let policy = RetryPolicy::with_exponential_backoff(5, 100, None, 0.5);
        for attempt in 0..5 {
            let base = 100u64 << attempt;
            let d = policy.delay_ms(attempt);
            assert_eq!(d, policy.delay_ms(attempt));
            assert!(d >= base && d <= base + base / 2);
        }
    }

    #[test]
    fn huge_attempts_saturate_instead_of_overflowing() {
        let policy = RetryPolicy::with_exponential_backoff(u32::MAX, 1_000, None, 0.0);
        assert_eq!(policy.delay_ms(200), u64::MAX);
    }
}
