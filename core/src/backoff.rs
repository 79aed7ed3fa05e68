/*
 * backoff.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a concurrent HTTP client library.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Backoff strategies for the retry engine: exponential with optional
//! jitter, and decorrelated jitter. Randomness comes from a small seedable
//! xorshift generator so delays are deterministic under a fixed seed.

use std::sync::Mutex;
use std::time::Duration;

/// Delay policy. `attempt` is zero-based; `prior` is the previous delay for
/// strategies that feed back on it.
pub trait BackoffStrategy: Send + Sync {
    fn next_delay(&self, attempt: u32, prior: Option<Duration>) -> Duration;
}

/// xorshift64* generator. Not cryptographic; only spreads retry timing.
struct JitterRng {
    state: u64,
}

impl JitterRng {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn seeded_from_clock() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(0x9e3779b97f4a7c15);
        Self::new(nanos | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    /// Uniform float in [lo, hi).
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        let unit = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        lo + unit * (hi - lo)
    }
}

/// delay(n) = min(initial * multiplier^n, max_backoff), optionally scaled by
/// uniform(0.5, 1.5) jitter.
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_backoff: Duration,
    jitter: bool,
    rng: Mutex<JitterRng>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max_backoff: Duration, jitter: bool) -> Self {
        Self {
            initial,
            multiplier,
            max_backoff,
            jitter,
            rng: Mutex::new(JitterRng::seeded_from_clock()),
        }
    }

    /// Fixed seed, for deterministic tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(JitterRng::new(seed));
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 2.0, Duration::from_secs(60), true)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, _prior: Option<Duration>) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let scaled = if self.jitter {
            capped * self.rng.lock().unwrap().uniform(0.5, 1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// delay(0) = base; delay(n) = min(uniform(base, prior * 3), max_backoff).
pub struct DecorrelatedJitterBackoff {
    base: Duration,
    max_backoff: Duration,
    rng: Mutex<JitterRng>,
}

impl DecorrelatedJitterBackoff {
    pub fn new(base: Duration, max_backoff: Duration) -> Self {
        Self { base, max_backoff, rng: Mutex::new(JitterRng::seeded_from_clock()) }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(JitterRng::new(seed));
        self
    }
}

impl BackoffStrategy for DecorrelatedJitterBackoff {
    fn next_delay(&self, attempt: u32, prior: Option<Duration>) -> Duration {
        if attempt == 0 {
            return self.base.min(self.max_backoff);
        }
        let prior = prior.unwrap_or(self.base).as_secs_f64();
        let lo = self.base.as_secs_f64();
        let hi = (prior * 3.0).max(lo);
        let drawn = self.rng.lock().unwrap().uniform(lo, hi);
        Duration::from_secs_f64(drawn.min(self.max_backoff.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_without_jitter_is_exact() {
        let b = ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(2), false);
        assert_eq!(b.next_delay(0, None), Duration::from_millis(100));
        assert_eq!(b.next_delay(1, None), Duration::from_millis(200));
        assert_eq!(b.next_delay(2, None), Duration::from_millis(400));
        // Capped at max_backoff.
        assert_eq!(b.next_delay(10, None), Duration::from_secs(2));
    }

    #[test]
    fn exponential_jitter_stays_in_band() {
        let b = ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(60), true)
            .with_seed(42);
        for attempt in 0..8 {
            let nominal = 0.1 * 2f64.powi(attempt);
            let d = b.next_delay(attempt as u32, None).as_secs_f64();
            assert!(d >= nominal * 0.5 - 1e-9, "attempt {attempt}: {d} < {}", nominal * 0.5);
            assert!(d <= nominal * 1.5 + 1e-9, "attempt {attempt}: {d} > {}", nominal * 1.5);
        }
    }

    #[test]
    fn seeded_sequences_are_deterministic() {
        let a = ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(60), true)
            .with_seed(7);
        let b = ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(60), true)
            .with_seed(7);
        for attempt in 0..5 {
            assert_eq!(a.next_delay(attempt, None), b.next_delay(attempt, None));
        }
    }

    #[test]
    fn decorrelated_bounds_hold() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let b = DecorrelatedJitterBackoff::new(base, max).with_seed(99);
        let mut prior = b.next_delay(0, None);
        assert_eq!(prior, base);
        for attempt in 1..6 {
            let d = b.next_delay(attempt, Some(prior));
            assert!(d >= base, "delay {d:?} below base");
            let ceil = Duration::from_secs_f64((prior.as_secs_f64() * 3.0).min(max.as_secs_f64()));
            assert!(d <= ceil + Duration::from_millis(1), "delay {d:?} above {ceil:?}");
            prior = d;
        }
    }
}
