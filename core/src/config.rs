/*
 * config.rs
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

//! Client configuration: pool caps, protocol selection, timeouts, retry and
//! breaker policies, observability hooks. Per-request overrides live in
//! `RequestOptions`.

use std::sync::Arc;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::headers::HeaderMap;
use crate::retry::RetryPolicy;
use crate::trace::{MetricsCollector, Tracer};

#[derive(Clone)]
pub struct ClientConfig {
    /// Global connection cap across all hosts.
    pub max_connections: usize,
    /// Idle (keep-alive) connections retained per host.
    pub max_keepalive_connections: usize,
    /// Idle age beyond which connections are reaped.
    pub max_keepalive: Duration,
    pub enable_http2: bool,
    /// Refuse to run HTTP/1.1: ALPN must produce h2, plaintext uses prior
    /// knowledge.
    pub http2_only: bool,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub breaker: Option<BreakerConfig>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub metrics: Option<Arc<dyn MetricsCollector>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_keepalive_connections: 20,
            max_keepalive: Duration::from_secs(300),
            enable_http2: true,
            http2_only: false,
            connect_timeout: Some(Duration::from_secs(15)),
            read_timeout: None,
            request_timeout: None,
            retry: RetryPolicy::default(),
            breaker: None,
            tracer: None,
            metrics: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_connections", &self.max_connections)
            .field("max_keepalive_connections", &self.max_keepalive_connections)
            .field("max_keepalive", &self.max_keepalive)
            .field("enable_http2", &self.enable_http2)
            .field("http2_only", &self.http2_only)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Per-call overrides for `Client::send`.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    /// Skip breaker consultation for this request.
    pub breaker_override: bool,
    /// Extra headers merged in (without replacing request headers).
    pub headers_extra: Option<HeaderMap>,
    /// Prefer multiplexing onto an existing HTTP/2 connection.
    pub prefer_h2: Option<bool>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("breaker_override", &self.breaker_override)
            .field("prefer_h2", &self.prefer_h2)
            .finish_non_exhaustive()
    }
}
