//! Retry delay schedules
//!
//! A [`Backoff`] is a stateless description of a schedule; every call to
//! [`Backoff::delays`] starts a fresh, endless sequence. Callers that need a
//! bounded number of retries stop iterating on their own.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth factor between two exponential steps
pub const MULTIPLIER: f64 = 1.5;

/// Relative jitter applied to each exponential step (±50%)
pub const RANDOMIZATION_FACTOR: f64 = 0.5;

/// Shape of the delay sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Grow by [`MULTIPLIER`] with jitter, capped at the max interval
    #[default]
    Exponential,
    /// Always the min interval
    Constant,
    /// Retry immediately
    Zero,
}

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Schedule shape
    #[serde(default)]
    pub kind: BackoffKind,
    /// First (and, for constant, every) delay in milliseconds
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Upper bound for any delay in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 {
    200
}

fn default_max_interval_ms() -> u64 {
    60_000
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

impl Backoff {
    /// Create a policy; `max` is raised to `min` when smaller
    pub fn new(kind: BackoffKind, min_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self {
            kind,
            min_interval_ms,
            max_interval_ms: max_interval_ms.max(min_interval_ms),
        }
    }

    /// Exponential policy
    pub fn exponential(min_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self::new(BackoffKind::Exponential, min_interval_ms, max_interval_ms)
    }

    /// Constant policy
    pub fn constant(interval_ms: u64) -> Self {
        Self::new(BackoffKind::Constant, interval_ms, interval_ms)
    }

    /// Zero-delay policy
    pub fn zero() -> Self {
        Self::new(BackoffKind::Zero, 0, 0)
    }

    /// Start a new endless delay sequence
    pub fn delays(&self) -> Delays {
        Delays {
            policy: *self,
            current: self.min_interval_ms as f64,
            jitter: true,
        }
    }

    /// Delay sequence without randomisation
    #[cfg(test)]
    pub(crate) fn delays_without_jitter(&self) -> Delays {
        Delays {
            jitter: false,
            ..self.delays()
        }
    }
}

/// Endless iterator of retry delays
#[derive(Debug, Clone)]
pub struct Delays {
    policy: Backoff,
    current: f64,
    jitter: bool,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let max = self.policy.max_interval_ms as f64;
        let millis = match self.policy.kind {
            BackoffKind::Zero => 0.0,
            BackoffKind::Constant => self.policy.min_interval_ms as f64,
            BackoffKind::Exponential => {
                let base = self.current;
                self.current = (self.current * MULTIPLIER).min(max);
                if self.jitter {
                    randomize(base).min(max)
                } else {
                    base
                }
            }
        };
        Some(Duration::from_millis(millis as u64))
    }
}

fn randomize(base: f64) -> f64 {
    let delta = RANDOMIZATION_FACTOR * base;
    let low = base - delta;
    let high = base + delta;
    if high <= low {
        return base;
    }
    rand::thread_rng().gen_range(low..=high)
}
