/*
 * breaker.rs
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

//! Circuit breaker: closed/open/half-open state machine gating request
//! admission, either one global circuit or one per host key (LRU-bounded).
//!
//! Closed counts consecutive qualifying failures inside a rolling window;
//! at the threshold the circuit opens and rejects without any network I/O.
//! After the recovery timeout a limited number of probes is admitted; enough
//! successes close the circuit, any failure reopens it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use std::sync::Mutex;

use crate::error::{Error, ErrorKind};
use crate::request::HostKey;

/// Whether one circuit covers all traffic or each host gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerScope {
    Global,
    PerHost,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures within `window` that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before admitting probes.
    pub recovery_timeout: Duration,
    /// Probe successes required to close again.
    pub success_threshold: u32,
    /// Rolling window for the failure count.
    pub window: Duration,
    pub scope: BreakerScope,
    /// Bound on tracked per-host circuits; least-recently-touched evicted.
    pub max_hosts: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            window: Duration::from_secs(60),
            scope: BreakerScope::PerHost,
            max_hosts: 256,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CircuitState {
    Closed { failures: u32, window_start: Instant },
    Open { opened_at: Instant },
    HalfOpen { probes_remaining: u32, successes: u32 },
}

impl CircuitState {
    fn closed(now: Instant) -> Self {
        CircuitState::Closed { failures: 0, window_start: now }
    }
}

struct Entry {
    state: CircuitState,
    last_touched: Instant,
}

struct Inner {
    global: CircuitState,
    hosts: HashMap<HostKey, Entry>,
}

/// Per-key admission gate. Consulted before connection acquisition; told the
/// outcome after the response or failure.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(Inner { global: CircuitState::closed(now), hosts: HashMap::new() }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admit or reject a request for `key`. An open circuit past its
    /// recovery timeout converts to half-open and admits this call as a
    /// probe. Rejection carries no network cost.
    pub fn admit(&self, key: &HostKey) -> Result<(), Error> {
        let now = Instant::now();
        let config = self.config.clone();
        let mut inner = self.inner.lock().unwrap();
        let state = Self::state_for(&mut inner, &config, key, now);
        match *state {
            CircuitState::Closed { .. } => Ok(()),
            CircuitState::Open { opened_at } => {
                if now.duration_since(opened_at) >= config.recovery_timeout {
                    // First probe of the half-open phase.
                    *state = CircuitState::HalfOpen {
                        probes_remaining: config.success_threshold.saturating_sub(1),
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::CircuitOpen { key: Self::key_name(&config, key) }))
                }
            }
            CircuitState::HalfOpen { ref mut probes_remaining, .. } => {
                if *probes_remaining > 0 {
                    *probes_remaining -= 1;
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::CircuitOpen { key: Self::key_name(&config, key) }))
                }
            }
        }
    }

    /// Record a successful outcome for `key`.
    pub fn record_success(&self, key: &HostKey) {
        let now = Instant::now();
        let config = self.config.clone();
        let mut inner = self.inner.lock().unwrap();
        let state = Self::state_for(&mut inner, &config, key, now);
        match *state {
            CircuitState::Closed { .. } => {
                *state = CircuitState::closed(now);
            }
            CircuitState::HalfOpen { probes_remaining, successes } => {
                let successes = successes + 1;
                if successes >= config.success_threshold {
                    log::debug!("circuit for {} closed after {successes} probe successes", key);
                    *state = CircuitState::closed(now);
                } else {
                    *state = CircuitState::HalfOpen { probes_remaining, successes };
                }
            }
            // A success from a request admitted before the circuit reopened.
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a qualifying failure for `key`. Returns true when this failure
    /// tripped the circuit open (for the circuit_trips metric).
    pub fn record_failure(&self, key: &HostKey) -> bool {
        let now = Instant::now();
        let config = self.config.clone();
        let mut inner = self.inner.lock().unwrap();
        let state = Self::state_for(&mut inner, &config, key, now);
        match *state {
            CircuitState::Closed { failures, window_start } => {
                let (failures, window_start) = if now.duration_since(window_start) > config.window {
                    (1, now)
                } else {
                    (failures + 1, window_start)
                };
                if failures >= config.failure_threshold {
                    log::warn!("circuit for {} opened after {failures} failures", key);
                    *state = CircuitState::Open { opened_at: now };
                    true
                } else {
                    *state = CircuitState::Closed { failures, window_start };
                    false
                }
            }
            CircuitState::HalfOpen { .. } => {
                log::warn!("circuit for {} reopened by failed probe", key);
                *state = CircuitState::Open { opened_at: now };
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    /// True if a request for `key` would currently be rejected.
    pub fn is_open(&self, key: &HostKey) -> bool {
        let now = Instant::now();
        let config = self.config.clone();
        let mut inner = self.inner.lock().unwrap();
        match *Self::state_for(&mut inner, &config, key, now) {
            CircuitState::Open { opened_at } => {
                now.duration_since(opened_at) < config.recovery_timeout
            }
            _ => false,
        }
    }

    fn key_name(config: &BreakerConfig, key: &HostKey) -> String {
        match config.scope {
            BreakerScope::Global => "all hosts".to_string(),
            BreakerScope::PerHost => key.to_string(),
        }
    }

    fn state_for<'a>(
        inner: &'a mut Inner,
        config: &BreakerConfig,
        key: &HostKey,
        now: Instant,
    ) -> &'a mut CircuitState {
        match config.scope {
            BreakerScope::Global => &mut inner.global,
            BreakerScope::PerHost => {
                if !inner.hosts.contains_key(key) && inner.hosts.len() >= config.max_hosts {
                    // Evict the least recently touched circuit.
                    if let Some(oldest) = inner
                        .hosts
                        .iter()
                        .min_by_key(|(_, e)| e.last_touched)
                        .map(|(k, _)| k.clone())
                    {
                        inner.hosts.remove(&oldest);
                    }
                }
                let entry = inner
                    .hosts
                    .entry(key.clone())
                    .or_insert_with(|| Entry { state: CircuitState::closed(now), last_touched: now });
                entry.last_touched = now;
                &mut entry.state
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Scheme;

    fn key(host: &str) -> HostKey {
        HostKey { scheme: Scheme::Http, host: host.to_string(), port: 80 }
    }

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            success_threshold: 2,
            window: Duration::from_secs(60),
            scope: BreakerScope::PerHost,
            max_hosts: 4,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = CircuitBreaker::new(quick_config());
        let k = key("a");
        assert!(b.admit(&k).is_ok());
        assert!(!b.record_failure(&k));
        assert!(!b.record_failure(&k));
        assert!(b.record_failure(&k), "third failure should trip");
        let err = b.admit(&k).unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let b = CircuitBreaker::new(quick_config());
        let k = key("a");
        b.record_failure(&k);
        b.record_failure(&k);
        b.record_success(&k);
        assert!(!b.record_failure(&k));
        assert!(!b.record_failure(&k));
        assert!(b.record_failure(&k));
    }

    #[test]
    fn recovery_admits_limited_probes_then_closes() {
        let b = CircuitBreaker::new(quick_config());
        let k = key("a");
        for _ in 0..3 {
            b.record_failure(&k);
        }
        assert!(b.admit(&k).is_err());
        std::thread::sleep(Duration::from_millis(60));

        // success_threshold probes admitted, no more.
        assert!(b.admit(&k).is_ok());
        assert!(b.admit(&k).is_ok());
        assert!(b.admit(&k).is_err());

        b.record_success(&k);
        b.record_success(&k);
        assert!(b.admit(&k).is_ok(), "circuit should be closed again");
    }

    #[test]
    fn failed_probe_reopens() {
        let b = CircuitBreaker::new(quick_config());
        let k = key("a");
        for _ in 0..3 {
            b.record_failure(&k);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.admit(&k).is_ok());
        assert!(b.record_failure(&k), "probe failure reopens");
        assert!(b.admit(&k).is_err());
    }

    #[test]
    fn per_host_isolation() {
        let b = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            b.record_failure(&key("down"));
        }
        assert!(b.admit(&key("down")).is_err());
        assert!(b.admit(&key("up")).is_ok());
    }

    #[test]
    fn global_scope_shares_one_circuit() {
        let mut config = quick_config();
        config.scope = BreakerScope::Global;
        let b = CircuitBreaker::new(config);
        for _ in 0..3 {
            b.record_failure(&key("a"));
        }
        assert!(b.admit(&key("b")).is_err());
    }

    #[test]
    fn host_entries_are_lru_bounded() {
        let b = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            b.record_failure(&key("h0"));
        }
        // Touch enough other hosts to evict h0 (max_hosts = 4).
        for i in 1..=4 {
            let _ = b.admit(&key(&format!("h{i}")));
        }
        // h0 was evicted, so its circuit is fresh.
        assert!(b.admit(&key("h0")).is_ok());
    }
}
