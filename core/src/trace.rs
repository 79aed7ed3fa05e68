/*
 * trace.rs
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

//! Observability hooks. Both are capability objects with synchronous
//! methods; implementations that need async work queue it internally.
//! Default implementations are no-ops, so implementors override only what
//! they consume.

use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::response::Protocol;

/// Request lifecycle phases reported to the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Dns,
    Connect,
    Tls,
    RequestSent,
    FirstByte,
    /// A 1xx response other than the Expect-flow 100 was received and
    /// discarded.
    Informational,
    Complete,
}

/// Phase callback invoked as a request progresses.
pub trait Tracer: Send + Sync {
    fn on_phase(
        &self,
        _phase: TracePhase,
        _url: &Url,
        _elapsed: Duration,
        _protocol: Option<Protocol>,
        _error: Option<&Error>,
    ) {
    }
}

/// Counters the client increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    RequestsTotal,
    RequestsFailed,
    RetriesTotal,
    ConnectionsCreated,
    ConnectionsReused,
    CircuitTrips,
}

/// Metrics sink for counters and the pool-wait histogram.
pub trait MetricsCollector: Send + Sync {
    fn increment(&self, _counter: Counter, _by: u64) {}
    fn observe_pool_wait(&self, _nanos: u64) {}
}

/// No-op tracer, used when none is configured.
pub struct NullTracer;

impl Tracer for NullTracer {}

/// No-op metrics collector.
pub struct NullMetrics;

impl MetricsCollector for NullMetrics {}
