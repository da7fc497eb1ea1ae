//! Backoff strategies for retry scheduling.
//!
//! A strategy maps a 1-based attempt number to the delay taken before the
//! next attempt. The deterministic strategies are pure functions of the
//! attempt number; the jittered ones draw from the process RNG, with a
//! `*_with_rng` seam for seeded, reproducible tests.
//!
//! The decorrelated strategy is deliberately stateless: it samples uniformly
//! from `[base, min(max, base * 3^(n-1))]` instead of chaining on the previous
//! delay, so one strategy value can serve concurrent executions. Aggregate
//! spread is equivalent to the classic stateful recipe.

use rand::Rng;
use std::time::Duration;

/// Delay strategy for retries.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// Delay grows linearly: `base * n`.
    Linear { base: Duration },
    /// Delay doubles each attempt: `base * 2^(n-1)`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
    /// Uniform draw from `[0, exponential delay]`.
    FullJitter { base: Duration, max: Option<Duration> },
    /// Inner strategy's delay plus a uniform draw from `[0, jitter]`.
    AddedJitter { inner: Box<Backoff>, jitter: Duration },
    /// Uniform draw from `[base, min(max, base * 3^(n-1))]`.
    Decorrelated { base: Duration, max: Duration },
    /// Inner strategy's delay clamped to `max`.
    Capped { inner: Box<Backoff>, max: Duration },
}

impl Backoff {
    pub fn none() -> Self {
        Backoff::None
    }

    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    pub fn full_jitter(base: Duration) -> Self {
        Backoff::FullJitter { base, max: None }
    }

    pub fn added_jitter(inner: Backoff, jitter: Duration) -> Self {
        Backoff::AddedJitter { inner: Box::new(inner), jitter }
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Backoff::Decorrelated { base, max }
    }

    pub fn capped(inner: Backoff, max: Duration) -> Self {
        Backoff::Capped { inner: Box::new(inner), max }
    }

    /// Set a cap on the exponential growth of `Exponential` and `FullJitter`;
    /// other strategies are returned unchanged.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match &mut self {
            Backoff::Exponential { max, .. } | Backoff::FullJitter { max, .. } => {
                *max = Some(cap);
            }
            _ => {}
        }
        self
    }

    /// Delay to take before the attempt following attempt `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Same as [`Backoff::delay`] but drawing jitter from the supplied RNG.
    pub fn delay_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                base.checked_mul(attempt as u32).unwrap_or(Duration::from_secs(u64::MAX))
            }
            Backoff::Exponential { base, max } => exponential_delay(*base, *max, attempt),
            Backoff::FullJitter { base, max } => {
                let ceiling = exponential_delay(*base, *max, attempt).as_millis() as u64;
                if ceiling == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=ceiling))
            }
            Backoff::AddedJitter { inner, jitter } => {
                let base = inner.delay_with_rng(attempt, rng);
                let jitter_millis = jitter.as_millis() as u64;
                if jitter_millis == 0 {
                    return base;
                }
                base.saturating_add(Duration::from_millis(rng.random_range(0..=jitter_millis)))
            }
            Backoff::Decorrelated { base, max } => {
                let floor = base.as_millis() as u64;
                let exponent = (attempt.saturating_sub(1)).min(u32::MAX as usize) as u32;
                let growth = floor.saturating_mul(3u64.saturating_pow(exponent));
                let ceiling = growth.min(max.as_millis() as u64);
                if ceiling <= floor {
                    return Duration::from_millis(floor);
                }
                Duration::from_millis(rng.random_range(floor..=ceiling))
            }
            Backoff::Capped { inner, max } => inner.delay_with_rng(attempt, rng).min(*max),
        }
    }
}

fn exponential_delay(base: Duration, max: Option<Duration>, attempt: usize) -> Duration {
    let exponent = (attempt.saturating_sub(1)).min(u32::MAX as usize) as u32;
    let multiplier = 2u32.saturating_pow(exponent);
    let delay = base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX));
    match max {
        Some(max) => delay.min(max),
        None => delay,
    }
}
