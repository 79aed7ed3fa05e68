/*
 * lib.rs
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

//! Corriere: a concurrent HTTP/1.1 + HTTP/2 client core for high-throughput
//! workloads.
//!
//! The centerpiece is the connection lifecycle subsystem: a pool that
//! tracks connections across hosts, multiplexes HTTP/2 streams, recycles
//! transport buffers, enforces per-host and global limits, and recovers
//! from partial failure through a retry engine backed by a circuit breaker.
//!
//! ```no_run
//! use corriere_core::{Client, ClientConfig, Method, Request, RequestOptions};
//!
//! # async fn run() -> Result<(), corriere_core::Error> {
//! let client = Client::new(ClientConfig::default());
//! let request = Request::builder(Method::Get, "https://example.com/").build()?;
//! let mut response = client.send(request, RequestOptions::default()).await?;
//! let body = response.read_text().await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod bufpool;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod h1;
pub mod h2;
pub mod headers;
pub mod hpack;
pub mod net;
pub mod pool;
pub mod request;
pub mod response;
pub mod retry;
pub mod trace;

pub use backoff::{BackoffStrategy, DecorrelatedJitterBackoff, ExponentialBackoff};
pub use breaker::{BreakerConfig, BreakerScope, CircuitBreaker};
pub use bufpool::BufferPool;
pub use client::Client;
pub use config::{ClientConfig, RequestOptions};
pub use error::{Error, ErrorCategory, ErrorKind};
pub use headers::HeaderMap;
pub use pool::ConnectionPool;
pub use request::{Body, ChunkSource, HostKey, Method, Request, RequestBuilder, Scheme};
pub use response::{Protocol, Response, ResponseBody};
pub use retry::RetryPolicy;
pub use trace::{Counter, MetricsCollector, TracePhase, Tracer};
