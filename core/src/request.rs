/*
 * request.rs
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

//! HTTP request model: method, absolute URL, headers, body, timeout.
//! Requests are immutable once submitted; the builder assembles them and
//! `validate` enforces the wire-safety rules before any I/O happens.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

use crate::error::Error;
use crate::headers::HeaderMap;

/// Query component safe set: encode controls, space, and the characters that
/// would change how the query parses.
const QUERY_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'+');

/// URL scheme accepted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

/// Pool partition key: scheme, lowercase host, port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(Error::validation(format!("unsupported scheme {other:?}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::validation("URL has no host"))?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self { scheme, host, port })
    }

    /// Host header value: bare host, or host:port for non-default ports.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Patch,
    Other(&'static str),
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other(s) => s,
        }
    }

    /// Idempotent per HTTP semantics; POST and PATCH are not.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get
                | Method::Head
                | Method::Put
                | Method::Delete
                | Method::Options
                | Method::Trace
        )
    }
}

/// A restartable source of body chunks for streamed uploads. `rewind` must
/// reset the source to its beginning; sources that cannot rewind return
/// false, which disables retry for the request.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
    fn rewind(&mut self) -> bool;
}

/// Request body: inline bytes, a finite chunk stream with optional known
/// length, or nothing.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream {
        source: Box<dyn ChunkSource>,
        len: Option<u64>,
    },
}

impl Body {
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Body::Bytes(data.into())
    }

    pub fn stream(source: Box<dyn ChunkSource>, len: Option<u64>) -> Self {
        Body::Stream { source, len }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::Stream { .. } => false,
        }
    }

    /// Length on the wire, when known up front.
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream { len, .. } => *len,
        }
    }

    /// Whether the body can be sent again on a retry.
    pub fn is_rewindable(&mut self) -> bool {
        match self {
            Body::Empty | Body::Bytes(_) => true,
            Body::Stream { source, .. } => source.rewind(),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream { len, .. } => write!(f, "Body::Stream(len={len:?})"),
        }
    }
}

/// An HTTP request ready for submission.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
    pub timeout: Option<Duration>,
    /// Overrides the method-derived idempotency when set.
    pub idempotent: Option<bool>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::Empty,
            timeout: None,
            idempotent: None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or_else(|| self.method.is_idempotent())
    }

    pub fn host_key(&self) -> Result<HostKey, Error> {
        HostKey::from_url(&self.url)
    }

    /// Origin-form request target: path plus query.
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    /// Wire-safety validation: scheme, host, method token, header values.
    pub fn validate(&self) -> Result<(), Error> {
        HostKey::from_url(&self.url)?;
        let m = self.method.as_str();
        if m.is_empty() {
            return Err(Error::validation("empty method"));
        }
        if m.bytes().any(|b| !b.is_ascii_uppercase() && b != b'-') {
            return Err(Error::validation(format!("invalid method token {m:?}")));
        }
        for (name, value) in self.headers.iter() {
            if name.is_empty() || name.bytes().any(|b| b == b'\r' || b == b'\n' || b == b':' || b == b' ')
            {
                return Err(Error::validation(format!("invalid header name {name:?}")));
            }
            if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(Error::validation(format!("header {name:?} contains CR/LF")));
            }
        }
        Ok(())
    }
}

/// Builder for `Request`. Obtain via `Request::builder` or `Client` helpers.
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    url: Result<Url, Error>,
    headers: HeaderMap,
    body: Body,
    timeout: Option<Duration>,
    idempotent: Option<bool>,
}

impl Request {
    pub fn builder(method: Method, url: &str) -> RequestBuilder {
        RequestBuilder {
            method,
            url: Url::parse(url).map_err(|e| Error::validation(format!("bad URL {url:?}: {e}"))),
            headers: HeaderMap::new(),
            body: Body::Empty,
            timeout: None,
            idempotent: None,
        }
    }
}

impl RequestBuilder {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Append a percent-encoded query parameter to the URL.
    pub fn param(mut self, name: &str, value: &str) -> Self {
        if let Ok(url) = &mut self.url {
            let name = utf8_percent_encode(name, QUERY_COMPONENT).to_string();
            let value = utf8_percent_encode(value, QUERY_COMPONENT).to_string();
            let pair = format!("{name}={value}");
            let merged = match url.query() {
                Some(q) if !q.is_empty() => format!("{q}&{pair}"),
                _ => pair,
            };
            url.set_query(Some(&merged));
        }
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn body_bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(data.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Force the idempotency flag, e.g. to allow retrying a POST.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn build(self) -> Result<Request, Error> {
        let request = Request {
            method: self.method,
            url: self.url?,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            idempotent: self.idempotent,
        };
        request.validate()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_lowercases_and_defaults_port() {
        let url = Url::parse("https://Example.COM/path").unwrap();
        let key = HostKey::from_url(&url).unwrap();
        assert_eq!(key.host, "example.com");
        assert_eq!(key.port, 443);
        assert_eq!(key.authority(), "example.com");

        let url = Url::parse("http://example.com:8080/").unwrap();
        let key = HostKey::from_url(&url).unwrap();
        assert_eq!(key.port, 8080);
        assert_eq!(key.authority(), "example.com:8080");
    }

    #[test]
    fn idempotency_follows_method_unless_overridden() {
        let req = Request::builder(Method::Get, "http://h/").build().unwrap();
        assert!(req.is_idempotent());
        let req = Request::builder(Method::Post, "http://h/").build().unwrap();
        assert!(!req.is_idempotent());
        let req = Request::builder(Method::Post, "http://h/")
            .idempotent(true)
            .build()
            .unwrap();
        assert!(req.is_idempotent());
    }

    #[test]
    fn params_are_percent_encoded_and_appended() {
        let req = Request::builder(Method::Get, "http://h/search?q=1")
            .param("name", "a b&c")
            .build()
            .unwrap();
        assert_eq!(req.request_target(), "/search?q=1&name=a%20b%26c");
    }

    #[test]
    fn crlf_in_header_value_is_rejected() {
        let err = Request::builder(Method::Get, "http://h/")
            .header("x-bad", "a\r\nInjected: yes")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("CR/LF"));
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(Request::builder(Method::Get, "ftp://h/").build().is_err());
    }

    #[test]
    fn body_lengths() {
        assert_eq!(Body::Empty.known_len(), Some(0));
        assert_eq!(Body::bytes("abc").known_len(), Some(3));
    }
}
