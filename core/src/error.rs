/*
 * error.rs
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

//! Error taxonomy. A closed set of failure kinds, each mapped to zero or more
//! retry categories. Retry and circuit-breaker logic branch on the category
//! tags, never on type identity of an underlying error.

use std::io;
use std::time::Duration;

/// Category tags used by retry policies and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    Timeout,
    Server,
    RateLimit,
    Connection,
}

/// The failure kinds corriere can surface.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("connection error: {detail}")]
    Connection {
        detail: String,
        /// True when the failure happened before any request bytes reached
        /// the server (connect or TLS handshake), so a retry is always safe.
        pre_processing: bool,
        #[source]
        source: Option<io::Error>,
    },

    #[error("protocol error: {detail}")]
    Protocol {
        detail: String,
        /// True when the server provably did not process the request
        /// (e.g. the stream id is above a GOAWAY last-processed id).
        pre_processing: bool,
    },

    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("redirect chain exceeded {0} hops")]
    TooManyRedirects(u32),

    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    #[error("connection pool exhausted for {host} after {waited:?}")]
    PoolExhausted { host: String, waited: Duration },

    #[error("request cancelled")]
    Cancelled,
}

/// A failure plus the request line it belongs to.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    request: Option<Box<RequestLine>>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(r) = &self.request {
            write!(f, " ({} {})", r.method, r.url)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Originating request, carried for diagnostics.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub url: String,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, request: None }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation(reason.into()))
    }

    pub fn connect_timeout(after: Duration) -> Self {
        Self::new(ErrorKind::ConnectTimeout(after))
    }

    pub fn read_timeout(after: Duration) -> Self {
        Self::new(ErrorKind::ReadTimeout(after))
    }

    pub fn connection(detail: impl Into<String>, source: io::Error) -> Self {
        Self::new(ErrorKind::Connection {
            detail: detail.into(),
            pre_processing: false,
            source: Some(source),
        })
    }

    pub fn connect_failed(detail: impl Into<String>, source: io::Error) -> Self {
        Self::new(ErrorKind::Connection {
            detail: detail.into(),
            pre_processing: true,
            source: Some(source),
        })
    }

    pub fn closed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection {
            detail: detail.into(),
            pre_processing: false,
            source: None,
        })
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol { detail: detail.into(), pre_processing: false })
    }

    /// The connection refused new work before the request reached the wire
    /// (closing, id space exhausted, broken mid-handshake). Always safe to
    /// retry on another connection.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection {
            detail: detail.into(),
            pre_processing: true,
            source: None,
        })
    }

    /// A request the server promised (via GOAWAY) not to have processed.
    pub fn not_processed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol { detail: detail.into(), pre_processing: true })
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    pub fn with_request(mut self, method: &str, url: &str) -> Self {
        if self.request.is_none() {
            self.request = Some(Box::new(RequestLine {
                method: method.to_string(),
                url: url.to_string(),
            }));
        }
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn request(&self) -> Option<&RequestLine> {
        self.request.as_deref()
    }

    /// Category tags for this failure. Empty means never retried by category.
    pub fn categories(&self) -> &'static [ErrorCategory] {
        use ErrorCategory::*;
        match &self.kind {
            ErrorKind::Validation(_) => &[],
            ErrorKind::ConnectTimeout(_) => &[Timeout, Connection],
            ErrorKind::ReadTimeout(_) => &[Timeout],
            ErrorKind::Connection { .. } => &[Connection, Transient],
            ErrorKind::Protocol { .. } => &[],
            ErrorKind::HttpStatus { status } => match status {
                429 => &[RateLimit],
                500..=599 => &[Server, Transient],
                _ => &[],
            },
            ErrorKind::TooManyRedirects(_) => &[],
            ErrorKind::CircuitOpen { .. } => &[],
            ErrorKind::PoolExhausted { .. } => &[Transient],
            ErrorKind::Cancelled => &[],
        }
    }

    /// True when the failure provably happened before the server could have
    /// acted on the request, making a retry safe even for non-idempotent
    /// methods.
    pub fn is_pre_processing(&self) -> bool {
        match &self.kind {
            ErrorKind::ConnectTimeout(_) => true,
            ErrorKind::PoolExhausted { .. } => true,
            ErrorKind::Connection { pre_processing, .. } => *pre_processing,
            ErrorKind::Protocol { pre_processing, .. } => *pre_processing,
            _ => false,
        }
    }

    /// Whether this failure counts against the circuit breaker. Only the
    /// TRANSIENT/SERVER/CONNECTION/TIMEOUT categories trip it.
    pub fn trips_breaker(&self) -> bool {
        self.categories().iter().any(|c| {
            matches!(
                c,
                ErrorCategory::Transient
                    | ErrorCategory::Server
                    | ErrorCategory::Connection
                    | ErrorCategory::Timeout
            )
        })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.kind, ErrorKind::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// The HTTP status, when this is a status failure.
    pub fn http_status(&self) -> Option<u16> {
        match self.kind {
            ErrorKind::HttpStatus { status } => Some(status),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.http_status(), Some(s) if (400..500).contains(&s))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.http_status(), Some(s) if (500..600).contains(&s))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = Error::new(ErrorKind::HttpStatus { status: 503 });
        assert!(e.categories().contains(&ErrorCategory::Server));
        assert!(e.categories().contains(&ErrorCategory::Transient));
        assert!(e.trips_breaker());

        let e = Error::new(ErrorKind::HttpStatus { status: 429 });
        assert_eq!(e.categories(), &[ErrorCategory::RateLimit]);
        assert!(!e.trips_breaker());

        let e = Error::new(ErrorKind::HttpStatus { status: 404 });
        assert!(e.categories().is_empty());
    }

    #[test]
    fn validation_never_trips_breaker() {
        let e = Error::validation("bad header");
        assert!(e.categories().is_empty());
        assert!(!e.trips_breaker());
    }

    #[test]
    fn connect_failures_are_pre_processing() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(Error::connect_failed("tcp connect", io).is_pre_processing());
        assert!(Error::connect_timeout(Duration::from_secs(1)).is_pre_processing());
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!Error::connection("mid-request", io).is_pre_processing());
    }

    #[test]
    fn goaway_unprocessed_is_pre_processing() {
        let e = Error::not_processed("stream 7 above GOAWAY last id 5");
        assert!(e.is_pre_processing());
        assert!(e.categories().is_empty());
    }

    #[test]
    fn request_context_in_display() {
        let e = Error::validation("no host").with_request("GET", "http://x/");
        let s = e.to_string();
        assert!(s.contains("no host"));
        assert!(s.contains("GET http://x/"));
    }
}
