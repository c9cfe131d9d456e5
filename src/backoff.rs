// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Policy
//!
//! Pure computation of the delay applied between retry attempts:
//!
//! `delay = min(initial_delay * multiplier^attempt, max_delay)`
//!
//! where `attempt` is zero-based (0 is the wait before the first retry). With
//! jitter enabled, the delay is scaled by a factor drawn uniformly from
//! `[0.5, 1.0]`, so it never exceeds `max_delay`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of an exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Total number of attempts, the first one included. Zero behaves as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor, expected to be >= 1.0.
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// A policy that waits the same `delay` between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        BackoffConfig {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Number of times an operation is invoked under this policy.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (zero-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max_nanos = self.max_delay.as_nanos().min(u64::MAX as u128) as u64;
        let initial_nanos = self.initial_delay.as_nanos().min(u64::MAX as u128) as u64;
        if initial_nanos == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.min(i32::MAX as u32) as i32;
        let grown = initial_nanos as f64 * self.multiplier.max(1.0).powi(exponent);

        // f64::min discards NaN and clamps an overflowed product
        let clamped = grown.min(max_nanos as f64);
        Duration::from_nanos(clamped as u64)
    }

    /// Delay before retry number `attempt` (zero-based), jitter applied when
    /// configured.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }

        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        Duration::from_nanos((base.as_nanos() as f64 * factor) as u64).min(base)
    }
}
