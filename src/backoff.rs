//! Exponential backoff with jitter, checked against a monotonic clock.
//!
//! Delay for the n-th consecutive failure is `base * 2^(n-1)`, scaled by a
//! uniform jitter factor in `[1 - j, 1 + j]`, then clamped to
//! `[floor, ceiling]`. Waiting is cooperative: callers ask [`Backoff::ready`]
//! each cycle instead of sleeping.

use rand::Rng;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub floor: Duration,
    pub ceiling: Duration,
    pub jitter_pct: u32,
}

impl BackoffPolicy {
    /// Upload, poll and handshake retries.
    pub const fn retry() -> Self {
        Self {
            base: Duration::from_millis(2_000),
            floor: Duration::from_millis(1_000),
            ceiling: Duration::from_millis(300_000),
            jitter_pct: 20,
        }
    }

    /// Link reconnection.
    pub const fn reconnect() -> Self {
        Self {
            base: Duration::from_secs(30),
            floor: Duration::from_secs(30),
            ceiling: Duration::from_secs(300),
            jitter_pct: 20,
        }
    }

    /// Un-jittered delay for the `failures`-th consecutive failure (1-based).
    pub fn nominal(&self, failures: u32) -> f64 {
        let exponent = failures.saturating_sub(1).min(40);
        self.base.as_millis() as f64 * 2f64.powi(exponent as i32)
    }

    /// Inclusive bounds any jittered delay for `failures` falls in.
    pub fn bounds(&self, failures: u32) -> (Duration, Duration) {
        let nominal = self.nominal(failures);
        let spread = f64::from(self.jitter_pct) / 100.0;
        (
            self.clamp_ms(nominal * (1.0 - spread)),
            self.clamp_ms(nominal * (1.0 + spread)),
        )
    }

    pub fn delay_for<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(failures);
        let spread = f64::from(self.jitter_pct) / 100.0;
        let factor = if spread > 0.0 {
            rng.gen_range((1.0 - spread)..=(1.0 + spread))
        } else {
            1.0
        };
        self.clamp_ms(nominal * factor)
    }

    fn clamp_ms(&self, ms: f64) -> Duration {
        let floor = self.floor.as_millis() as f64;
        let ceiling = self.ceiling.as_millis() as f64;
        Duration::from_millis(ms.min(ceiling).max(floor).round() as u64)
    }
}

/// Backoff state for one retry domain.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    current_delay: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            current_delay: Duration::ZERO,
            next_attempt: None,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay chosen after the most recent failure; zero after a reset.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_attempt
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Register a failure at `now` and return the delay before the next attempt.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self
            .policy
            .delay_for(self.failures, &mut rand::thread_rng());
        self.current_delay = delay;
        self.next_attempt = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.current_delay = Duration::ZERO;
        self.next_attempt = None;
    }
}
