//! Backoff curves for polling and retries.
//!
//! - `Backoff`: per-target polling interval that grows on hostile responses
//!   and decays back toward the base interval after clean cycles.
//! - `RetryPolicy`: bounded exponential delays for retries inside a cycle.

use std::time::Duration;

use rand::Rng;

use crate::models::PollPolicy;

/// Smallest growth applied when escalating, so a zero interval still backs off.
const MIN_ESCALATION_STEP: Duration = Duration::from_secs(1);

/// Polling interval state for one target.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    factor: f64,
    decay_after: u32,
    current: Duration,
    clean_streak: u32,
}

impl Backoff {
    /// Create a backoff starting at the policy's base interval.
    pub fn new(policy: &PollPolicy) -> Self {
        let base = policy.interval();
        Self {
            base,
            ceiling: policy.ceiling().max(base),
            factor: policy.backoff_factor,
            decay_after: policy.decay_after.max(1),
            current: base,
            clean_streak: 0,
        }
    }

    /// Current polling interval (without jitter).
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Whether the interval is above its base.
    pub fn is_backing_off(&self) -> bool {
        self.current > self.base
    }

    /// Multiply the interval after a block or auth exhaustion, capped at the ceiling.
    pub fn escalate(&mut self) -> Duration {
        self.clean_streak = 0;
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .unwrap_or(self.ceiling)
            .max(self.current.saturating_add(MIN_ESCALATION_STEP));
        self.current = grown.min(self.ceiling);
        self.current
    }

    /// Record a clean cycle; once the streak reaches `decay_after`, every
    /// further clean cycle divides the interval by the factor until it is
    /// back at base.
    pub fn record_clean(&mut self) -> Duration {
        self.clean_streak = self.clean_streak.saturating_add(1);
        if self.clean_streak >= self.decay_after && self.current > self.base {
            let shrunk = self.current.div_f64(self.factor);
            self.current = if shrunk <= self.base + Duration::from_millis(1) {
                self.base
            } else {
                shrunk
            };
        }
        self.current
    }
}

/// Bounded exponential retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Add a uniform random delay in `[0, bound]`.
pub fn jittered(interval: Duration, bound: Duration) -> Duration {
    if bound.is_zero() {
        return interval;
    }
    let extra = rand::thread_rng().gen_range(0..=bound.as_millis() as u64);
    interval.saturating_add(Duration::from_millis(extra))
}
