/*
 * client.rs
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

//! Request executor: validate, consult the circuit breaker, acquire a
//! connection, hand off to the transport, and wrap the outcome with retry.
//! One wall-clock deadline governs the whole call; closing the returned
//! response releases the connection (HTTP/1.1) or stream (HTTP/2).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::breaker::CircuitBreaker;
use crate::bufpool::BufferPool;
use crate::config::{ClientConfig, RequestOptions};
use crate::error::{Error, ErrorKind};
use crate::net;
use crate::pool::{Acquired, ConnectionPool, H1Release, PoolConfig};
use crate::request::{HostKey, Request};
use crate::response::{Protocol, Response, ResponseBody};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::trace::{Counter, MetricsCollector, TracePhase, Tracer};

/// The client core: owns the pool, buffer pool, and breaker.
pub struct Client {
    config: ClientConfig,
    pool: ConnectionPool,
    breaker: Option<Arc<CircuitBreaker>>,
    bufpool: BufferPool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let bufpool = BufferPool::new();
        let connector = net::tls_connector(config.enable_http2, config.http2_only);
        let pool_config = PoolConfig {
            max_connections: config.max_connections,
            max_per_host: config.max_keepalive_connections,
            max_keepalive: config.max_keepalive,
            acquire_timeout: config.request_timeout.unwrap_or(Duration::from_secs(30)),
            connect_timeout: config.connect_timeout.unwrap_or(Duration::from_secs(15)),
            read_timeout: config.read_timeout,
            prefs: net::ProtocolPrefs {
                enable_http2: config.enable_http2,
                http2_only: config.http2_only,
            },
            h2_keepalive: None,
            metrics: config.metrics.clone(),
        };
        let pool = ConnectionPool::new(pool_config, connector, bufpool.clone());
        let breaker = config.breaker.clone().map(|b| Arc::new(CircuitBreaker::new(b)));
        Self { config, pool, breaker, bufpool }
    }

    /// Pool introspection, used by benchmarks and tests.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.bufpool
    }

    /// Tear the client down: drain the pool and refuse new work.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Submit a request. Retries per the active policy; returns the literal
    /// response for any final status (status errors surface only through
    /// `raise_for_status`).
    pub async fn send(&self, request: Request, options: RequestOptions) -> Result<Response, Error> {
        let mut request = request;
        let method = request.method.as_str().to_string();
        let url = request.url.to_string();
        self.count(Counter::RequestsTotal);

        let result = self.send_inner(&mut request, &options).await;
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                self.count(Counter::RequestsFailed);
                Err(e.with_request(&method, &url))
            }
        }
    }

    async fn send_inner(
        &self,
        request: &mut Request,
        options: &RequestOptions,
    ) -> Result<Response, Error> {
        request.validate()?;
        if let Some(extra) = &options.headers_extra {
            request.headers.merge_missing(extra);
        }
        let key = request.host_key()?;
        let authority = key.authority();
        let policy: RetryPolicy =
            options.retry_policy.clone().unwrap_or_else(|| self.config.retry.clone());
        let prefer_h2 =
            self.config.enable_http2 && options.prefer_h2.unwrap_or(true);

        let total_timeout = request
            .timeout
            .or(options.timeout)
            .or(self.config.request_timeout);
        let deadline = total_timeout.map(|t| Instant::now() + t);
        let started = Instant::now();

        let mut retry_state = RetryState::new();
        loop {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::cancelled());
                }
            }
            if !options.breaker_override {
                if let Some(breaker) = &self.breaker {
                    breaker.admit(&key)?;
                }
            }

            let attempt = self.attempt(request, &key, &authority, prefer_h2, deadline).await;
            match attempt {
                Ok(response) => {
                    // A would-be-retried status (force list, category, or
                    // result predicate) is treated as a failure while
                    // attempts remain; otherwise the literal response is
                    // returned and status errors surface only through
                    // raise_for_status.
                    let status = response.status();
                    let status_error = Error::new(ErrorKind::HttpStatus { status });
                    if status_error.trips_breaker() {
                        self.record_breaker(&key, true);
                    } else {
                        // The downstream answered: any completed response
                        // outside the breaker's failure categories counts as
                        // a success, so a half-open probe that draws a 4xx
                        // still settles instead of wasting its probe slot.
                        self.record_breaker(&key, false);
                    }

                    let wants_status_retry = {
                        let headers = response.headers();
                        policy.decide(
                            &mut retry_state,
                            &status_error,
                            request.is_idempotent(),
                            request.body.is_rewindable(),
                            Some(headers),
                        )
                    };
                    match wants_status_retry {
                        RetryDecision::Retry { delay } => {
                            self.count(Counter::RetriesTotal);
                            drop(response);
                            self.sleep_within(delay, deadline).await?;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            self.trace(
                                TracePhase::Complete,
                                request,
                                started.elapsed(),
                                Some(response.protocol()),
                                None,
                            );
                            return Ok(response);
                        }
                    }
                }
                Err(e) => {
                    if e.trips_breaker() {
                        self.record_breaker(&key, true);
                    }
                    let decision = policy.decide(
                        &mut retry_state,
                        &e,
                        request.is_idempotent(),
                        request.body.is_rewindable(),
                        None,
                    );
                    match decision {
                        RetryDecision::Retry { delay } => {
                            self.count(Counter::RetriesTotal);
                            self.sleep_within(delay, deadline).await?;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            self.trace(
                                TracePhase::Complete,
                                request,
                                started.elapsed(),
                                None,
                                Some(&e),
                            );
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// One transport attempt: acquire, dispatch, wrap.
    async fn attempt(
        &self,
        request: &mut Request,
        key: &HostKey,
        authority: &str,
        prefer_h2: bool,
        deadline: Option<Instant>,
    ) -> Result<Response, Error> {
        let started = Instant::now();
        let acquired = self.pool.acquire(key, prefer_h2, deadline).await?;
        let pool_wait = started.elapsed();
        if let Some(metrics) = &self.config.metrics {
            metrics.observe_pool_wait(pool_wait.as_nanos() as u64);
        }
        self.trace(TracePhase::Connect, request, pool_wait, None, None);

        match acquired {
            Acquired::H1(conn, slot) => {
                self.trace(TracePhase::RequestSent, request, started.elapsed(), Some(Protocol::H1), None);
                let (head, reader, informational) = conn
                    .send_request(request, authority, deadline, H1Release::new(slot))
                    .await?;
                for status in informational {
                    log::debug!("discarded informational response {status}");
                    self.trace(TracePhase::Informational, request, started.elapsed(), Some(Protocol::H1), None);
                }
                self.trace(TracePhase::FirstByte, request, started.elapsed(), Some(Protocol::H1), None);
                Ok(Response::new(
                    head.status,
                    head.reason,
                    head.headers,
                    ResponseBody::h1(reader),
                    started.elapsed(),
                    Protocol::H1,
                    request.method.as_str().to_string(),
                    request.url.clone(),
                ))
            }
            Acquired::H2(conn) => {
                self.trace(TracePhase::RequestSent, request, started.elapsed(), Some(Protocol::H2), None);
                let head = conn
                    .send_request(request, authority, deadline, self.config.read_timeout)
                    .await?;
                for status in head.informational {
                    log::debug!("discarded informational response {status}");
                    self.trace(TracePhase::Informational, request, started.elapsed(), Some(Protocol::H2), None);
                }
                self.trace(TracePhase::FirstByte, request, started.elapsed(), Some(Protocol::H2), None);
                Ok(Response::new(
                    head.status,
                    String::new(),
                    head.headers,
                    ResponseBody::h2(head.reader),
                    started.elapsed(),
                    Protocol::H2,
                    request.method.as_str().to_string(),
                    request.url.clone(),
                ))
            }
        }
    }

    /// Sleep for the retry delay, but never past the overall deadline.
    async fn sleep_within(&self, delay: Duration, deadline: Option<Instant>) -> Result<(), Error> {
        if let Some(d) = deadline {
            let remaining = d.saturating_duration_since(Instant::now());
            if delay >= remaining {
                return Err(Error::cancelled());
            }
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn record_breaker(&self, key: &HostKey, failure: bool) {
        let Some(breaker) = &self.breaker else { return };
        if failure {
            if breaker.record_failure(key) {
                self.count(Counter::CircuitTrips);
            }
        } else {
            breaker.record_success(key);
        }
    }

    fn count(&self, counter: Counter) {
        if let Some(metrics) = &self.config.metrics {
            metrics.increment(counter, 1);
        }
    }

    fn trace(
        &self,
        phase: TracePhase,
        request: &Request,
        elapsed: Duration,
        protocol: Option<Protocol>,
        error: Option<&Error>,
    ) {
        if let Some(tracer) = &self.config.tracer {
            tracer.on_phase(phase, &request.url, elapsed, protocol, error);
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish_non_exhaustive()
    }
}
