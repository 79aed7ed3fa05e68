/*
 * retry.rs
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

//! Retry policy and per-request retry state. A failure is retried only when
//! attempts remain, the failure matches the policy (category, forced status,
//! or result predicate — OR-combined), the request is idempotent or the
//! failure provably happened before the server processed anything, and the
//! body can be sent again. Delays come from the backoff strategy, raised to
//! any `Retry-After` the server sent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::{BackoffStrategy, ExponentialBackoff};
use crate::error::{Error, ErrorCategory, ErrorKind};
use crate::headers::HeaderMap;

/// Result predicate: called with (status, headers); true forces a retry.
pub type ResultPredicate = Arc<dyn Fn(u16, &HeaderMap) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Transport attempts beyond the first.
    pub max_retries: u32,
    pub retry_categories: Vec<ErrorCategory>,
    /// Statuses retried regardless of category.
    pub status_force_list: Vec<u16>,
    pub backoff: Arc<dyn BackoffStrategy>,
    pub retry_if_result: Option<ResultPredicate>,
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_categories: vec![
                ErrorCategory::Transient,
                ErrorCategory::Timeout,
                ErrorCategory::Connection,
            ],
            status_force_list: Vec::new(),
            backoff: Arc::new(ExponentialBackoff::default()),
            retry_if_result: None,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retry_categories", &self.retry_categories)
            .field("status_force_list", &self.status_force_list)
            .field("respect_retry_after", &self.respect_retry_after)
            .finish_non_exhaustive()
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Mutable attempt bookkeeping for one request.
#[derive(Debug, Default)]
pub struct RetryState {
    attempt: u32,
    prior_delay: Option<Duration>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-based number of the attempt about to run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retries_used(&self) -> u32 {
        self.attempt
    }
}

impl RetryPolicy {
    /// Does the failure itself qualify (category, forced status, or result
    /// predicate)? The three checks are OR-combined. A protocol failure the
    /// server provably never processed (GOAWAY above the stream id, refused
    /// stream) qualifies unconditionally: the attempt cost nothing
    /// server-side.
    fn failure_qualifies(&self, error: &Error, headers: Option<&HeaderMap>) -> bool {
        if let ErrorKind::Protocol { pre_processing: true, .. } = error.kind() {
            return true;
        }
        if error.categories().iter().any(|c| self.retry_categories.contains(c)) {
            return true;
        }
        if let ErrorKind::HttpStatus { status } = error.kind() {
            if self.status_force_list.contains(status) {
                return true;
            }
            if let (Some(pred), Some(headers)) = (&self.retry_if_result, headers) {
                if pred(*status, headers) {
                    return true;
                }
            }
        }
        false
    }

    /// Decide whether to retry after `error`. `headers` are the response
    /// headers when the failure is a status failure (for `Retry-After` and
    /// the result predicate). Advances the retry state on a Retry decision.
    pub fn decide(
        &self,
        state: &mut RetryState,
        error: &Error,
        idempotent: bool,
        body_rewindable: bool,
        headers: Option<&HeaderMap>,
    ) -> RetryDecision {
        if state.attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        if error.is_circuit_open() || error.is_cancelled() {
            return RetryDecision::GiveUp;
        }
        if !self.failure_qualifies(error, headers) {
            return RetryDecision::GiveUp;
        }
        if !idempotent && !error.is_pre_processing() {
            return RetryDecision::GiveUp;
        }
        if !body_rewindable {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff.next_delay(state.attempt, state.prior_delay);
        if self.respect_retry_after {
            if let Some(ra) = headers.and_then(retry_after) {
                delay = delay.max(ra);
            }
        }
        log::debug!(
            "retrying after {:?} (attempt {} of {}): {}",
            delay,
            state.attempt + 1,
            self.max_retries,
            error
        );
        state.attempt += 1;
        state.prior_delay = Some(delay);
        RetryDecision::Retry { delay }
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn policy(max_retries: u32, categories: Vec<ErrorCategory>) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_categories: categories,
            status_force_list: Vec::new(),
            backoff: Arc::new(ExponentialBackoff::new(
                Duration::from_millis(10),
                2.0,
                Duration::from_secs(1),
                false,
            )),
            retry_if_result: None,
            respect_retry_after: true,
        }
    }

    fn connection_error() -> Error {
        Error::connection("reset", io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[test]
    fn retries_matching_category_up_to_max() {
        let p = policy(2, vec![ErrorCategory::Connection]);
        let mut state = RetryState::new();
        let e = connection_error();
        assert!(matches!(p.decide(&mut state, &e, true, true, None), RetryDecision::Retry { .. }));
        assert!(matches!(p.decide(&mut state, &e, true, true, None), RetryDecision::Retry { .. }));
        assert_eq!(p.decide(&mut state, &e, true, true, None), RetryDecision::GiveUp);
    }

    #[test]
    fn non_matching_category_gives_up() {
        let p = policy(3, vec![ErrorCategory::Timeout]);
        let mut state = RetryState::new();
        assert_eq!(
            p.decide(&mut state, &connection_error(), true, true, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn non_idempotent_retried_only_pre_processing() {
        let p = policy(3, vec![ErrorCategory::Connection, ErrorCategory::Timeout]);
        let mut state = RetryState::new();
        // Mid-request connection loss on a POST: not retriable.
        assert_eq!(
            p.decide(&mut state, &connection_error(), false, true, None),
            RetryDecision::GiveUp
        );
        // Connect failure on a POST: retriable.
        let e = Error::connect_failed(
            "refused",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(matches!(p.decide(&mut state, &e, false, true, None), RetryDecision::Retry { .. }));
    }

    #[test]
    fn non_rewindable_body_disables_retry() {
        let p = policy(3, vec![ErrorCategory::Connection]);
        let mut state = RetryState::new();
        assert_eq!(
            p.decide(&mut state, &connection_error(), true, false, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn forced_status_retries_via_or_combination() {
        let mut p = policy(1, vec![]);
        p.status_force_list = vec![503];
        let mut state = RetryState::new();
        let e = Error::new(ErrorKind::HttpStatus { status: 503 });
        let headers = HeaderMap::new();
        assert!(matches!(
            p.decide(&mut state, &e, true, true, Some(&headers)),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn result_predicate_is_or_combined() {
        let mut p = policy(1, vec![]);
        p.retry_if_result = Some(Arc::new(|status, _| status == 418));
        let mut state = RetryState::new();
        let e = Error::new(ErrorKind::HttpStatus { status: 418 });
        let headers = HeaderMap::new();
        assert!(matches!(
            p.decide(&mut state, &e, true, true, Some(&headers)),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn retry_after_raises_backoff_delay() {
        let mut p = policy(1, vec![ErrorCategory::RateLimit]);
        p.retry_categories = vec![ErrorCategory::RateLimit];
        let mut state = RetryState::new();
        let e = Error::new(ErrorKind::HttpStatus { status: 429 });
        let mut headers = HeaderMap::new();
        headers.append("Retry-After", "2");
        match p.decide(&mut state, &e, true, true, Some(&headers)) {
            RetryDecision::Retry { delay } => assert!(delay >= Duration::from_secs(2)),
            RetryDecision::GiveUp => panic!("should retry"),
        }
    }

    #[test]
    fn retry_after_http_date() {
        let mut headers = HeaderMap::new();
        let when = Utc::now() + chrono::Duration::seconds(30);
        headers.append("Retry-After", when.to_rfc2822());
        let d = retry_after(&headers).expect("parseable");
        assert!(d <= Duration::from_secs(30));
        assert!(d >= Duration::from_secs(25));
    }

    #[test]
    fn unprocessed_stream_is_retried_even_without_matching_category() {
        // GOAWAY said the server never saw this request; even a POST with
        // an empty category list may be replayed.
        let p = policy(2, vec![]);
        let mut state = RetryState::new();
        let e = Error::not_processed("stream 7 above GOAWAY last id 5");
        assert!(matches!(p.decide(&mut state, &e, false, true, None), RetryDecision::Retry { .. }));
    }

    #[test]
    fn mid_connection_protocol_error_is_not_retried() {
        let p = policy(2, vec![ErrorCategory::Transient]);
        let mut state = RetryState::new();
        let e = Error::protocol("HPACK violation");
        assert_eq!(p.decide(&mut state, &e, true, true, None), RetryDecision::GiveUp);
    }

    #[test]
    fn circuit_open_never_retried() {
        let p = policy(3, vec![ErrorCategory::Transient]);
        let mut state = RetryState::new();
        let e = Error::new(ErrorKind::CircuitOpen { key: "h".into() });
        assert_eq!(p.decide(&mut state, &e, true, true, None), RetryDecision::GiveUp);
    }
}
