/*
 * response.rs
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

//! HTTP response: status, headers, and a lazy body handle. Headers are
//! delivered before any body bytes exist; reading the body drives the
//! underlying connection (HTTP/1.1) or stream (HTTP/2). Dropping the body
//! unread releases the transport — back to the pool when reusable, reset or
//! closed when not.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::error::{Error, ErrorKind};
use crate::h1::H1BodyReader;
use crate::h2::H2BodyReader;
use crate::headers::HeaderMap;

/// Which transport produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    H1,
    H2,
}

/// A received response with its body still pending.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: String,
    headers: HeaderMap,
    body: ResponseBody,
    elapsed: Duration,
    protocol: Protocol,
    method: String,
    url: Url,
}

impl Response {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: u16,
        reason: String,
        headers: HeaderMap,
        body: ResponseBody,
        elapsed: Duration,
        protocol: Protocol,
        method: String,
        url: Url,
    ) -> Self {
        Self { status, reason, headers, body, elapsed, protocol, method, url }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Wall time from submission to response headers.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The URL this response was received for.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error out on 4xx/5xx, carrying the request line for diagnostics.
    pub fn raise_for_status(&self) -> Result<(), Error> {
        if self.status >= 400 {
            Err(Error::new(ErrorKind::HttpStatus { status: self.status })
                .with_request(&self.method, self.url.as_str()))
        } else {
            Ok(())
        }
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Read the entire body into one buffer.
    pub async fn read_all(&mut self) -> Result<Bytes, Error> {
        self.body.read_all().await
    }

    /// Read the entire body and decode as UTF-8.
    pub async fn read_text(&mut self) -> Result<String, Error> {
        self.body.read_text().await
    }

    /// Read the entire body and parse as JSON.
    pub async fn read_json(&mut self) -> Result<serde_json::Value, Error> {
        self.body.read_json().await
    }

    /// Next body chunk in wire order, or None at end of body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        self.body.chunk().await
    }
}

/// Lazy body handle. Variants cover a fully buffered body, an HTTP/1.1
/// connection mid-read, and an HTTP/2 stream.
pub struct ResponseBody {
    inner: BodyInner,
}

enum BodyInner {
    Buffered { chunks: VecDeque<Bytes> },
    H1(H1BodyReader),
    H2(H2BodyReader),
}

impl ResponseBody {
    pub(crate) fn buffered(data: Bytes) -> Self {
        let mut chunks = VecDeque::new();
        if !data.is_empty() {
            chunks.push_back(data);
        }
        Self { inner: BodyInner::Buffered { chunks } }
    }

    pub(crate) fn empty() -> Self {
        Self { inner: BodyInner::Buffered { chunks: VecDeque::new() } }
    }

    pub(crate) fn h1(reader: H1BodyReader) -> Self {
        Self { inner: BodyInner::H1(reader) }
    }

    pub(crate) fn h2(reader: H2BodyReader) -> Self {
        Self { inner: BodyInner::H2(reader) }
    }

    /// Next chunk in wire order; None once the body is complete. Errors here
    /// never invalidate the already-delivered response headers.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match &mut self.inner {
            BodyInner::Buffered { chunks } => Ok(chunks.pop_front()),
            BodyInner::H1(reader) => reader.next_chunk().await,
            BodyInner::H2(reader) => reader.next_chunk().await,
        }
    }

    pub async fn read_all(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub async fn read_text(&mut self) -> Result<String, Error> {
        let raw = self.read_all().await?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol("response body is not valid UTF-8"))
    }

    pub async fn read_json(&mut self) -> Result<serde_json::Value, Error> {
        let raw = self.read_all().await?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::protocol(format!("response body is not valid JSON: {e}")))
    }

    /// Response trailers, available once the body has been read to the end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        match &self.inner {
            BodyInner::Buffered { .. } => None,
            BodyInner::H1(reader) => reader.trailers(),
            BodyInner::H2(reader) => reader.trailers(),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            BodyInner::Buffered { chunks } => {
                write!(f, "ResponseBody::Buffered({} chunks)", chunks.len())
            }
            BodyInner::H1(_) => f.write_str("ResponseBody::H1"),
            BodyInner::H2(_) => f.write_str("ResponseBody::H2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(status: u16, body: ResponseBody) -> Response {
        Response::new(
            status,
            "Test".to_string(),
            HeaderMap::new(),
            body,
            Duration::ZERO,
            Protocol::H1,
            "GET".to_string(),
            Url::parse("http://test.local/").unwrap(),
        )
    }

    #[tokio::test]
    async fn buffered_body_reads() {
        let mut r = response_with(200, ResponseBody::buffered(Bytes::from_static(b"hi")));
        assert_eq!(r.read_text().await.unwrap(), "hi");
        // Fully drained afterwards.
        assert_eq!(r.chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_body_parses() {
        let mut r =
            response_with(200, ResponseBody::buffered(Bytes::from_static(b"{\"a\": [1, 2]}")));
        let v = r.read_json().await.unwrap();
        assert_eq!(v["a"][1], 2);
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_error() {
        let mut r = response_with(200, ResponseBody::buffered(Bytes::from_static(&[0xff, 0xfe])));
        assert!(r.read_text().await.is_err());
    }

    #[test]
    fn raise_for_status_thresholds() {
        assert!(response_with(200, ResponseBody::empty()).raise_for_status().is_ok());
        assert!(response_with(399, ResponseBody::empty()).raise_for_status().is_ok());
        assert!(response_with(404, ResponseBody::empty()).raise_for_status().is_err());
        assert!(response_with(503, ResponseBody::empty()).raise_for_status().is_err());
    }
}
