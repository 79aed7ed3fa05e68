/*
 * conn.rs
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

//! HTTP/1.1 client connection. Writes canonically framed requests, drives
//! the response parser, and decides reuse: the connection goes back to the
//! pool only when both directions completed and the body was drained. A
//! server that replies before the request body is finished aborts the send;
//! the connection is then unusable for another request because its framing
//! position is unknown.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

use bytes::Bytes;

use crate::bufpool::{BufferPool, PooledBuf};
use crate::conn::ConnMeta;
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::net::HttpStream;
use crate::request::{Body, Method, Request};

use super::parser::{BodyMode, BodySink, ResponseHead, ResponseParser};

/// Receives the connection back when a request/response cycle ends.
/// `release(Some(conn))` means the connection is reusable; `release(None)`
/// means the slot is free but the connection is gone (Broken or Closing).
/// Dropping the unreleased sink must free the slot too.
pub trait ConnRelease: Send {
    fn release(self: Box<Self>, conn: Option<H1Connection>);
}

/// One HTTP/1.1 connection.
pub struct H1Connection {
    read: ReadHalf<HttpStream>,
    write: WriteHalf<HttpStream>,
    buf: PooledBuf,
    parser: ResponseParser,
    reusable: bool,
    read_timeout: Option<Duration>,
    pub meta: ConnMeta,
}

impl H1Connection {
    pub fn new(stream: HttpStream, bufpool: &BufferPool, read_timeout: Option<Duration>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read,
            write,
            buf: bufpool.acquire(16 * 1024),
            parser: ResponseParser::new(),
            reusable: true,
            read_timeout,
            meta: ConnMeta::new(),
        }
    }

    /// Send `request` and read the response head. Returns the head, a lazy
    /// body reader owning this connection, and any informational statuses
    /// that were discarded on the way. `release` is invoked when the cycle
    /// ends (possibly before this function returns, for bodyless responses).
    pub async fn send_request(
        mut self,
        request: &mut Request,
        authority: &str,
        deadline: Option<Instant>,
        release: Box<dyn ConnRelease>,
    ) -> Result<(ResponseHead, H1BodyReader, Vec<u16>), Error> {
        self.parser.reset();
        self.meta.touch();

        let head = encode_head(request, authority);
        let expect_continue = request.headers.has_token("expect", "100-continue");
        let is_head = matches!(request.method, Method::Head);

        if let Err(e) = self.write_all_deadline(head.as_bytes(), deadline).await {
            release.release(None);
            return Err(e);
        }

        let mut informational = Vec::new();

        if expect_continue {
            // Wait for 100 Continue (or a final response) before the body.
            match self.read_head(deadline).await {
                Ok(head) if head.status == 100 => {
                    self.parser.reset();
                    if let Err(e) = self.send_body(request, deadline).await {
                        release.release(None);
                        return Err(e);
                    }
                }
                Ok(head) => {
                    // Final response without the body having been sent: the
                    // advertised framing was never completed, so this
                    // connection cannot be reused.
                    self.reusable = false;
                    return self.finish_response(head, is_head, informational, release, deadline);
                }
                Err(e) => {
                    release.release(None);
                    return Err(e);
                }
            }
        } else if !matches!(request.body, Body::Empty) {
            match self.send_body(request, deadline).await {
                Ok(false) => {}
                Ok(true) => {
                    log::debug!(
                        "server replied before request body completed; connection not reusable"
                    );
                    self.reusable = false;
                }
                Err(e) => {
                    release.release(None);
                    return Err(e);
                }
            }
        }

        // Read response heads until a final (non-1xx) status.
        loop {
            let head = match self.read_head(deadline).await {
                Ok(h) => h,
                Err(e) => {
                    release.release(None);
                    return Err(e);
                }
            };
            if (100..200).contains(&head.status) {
                informational.push(head.status);
                self.parser.reset();
                continue;
            }
            return self.finish_response(head, is_head, informational, release, deadline);
        }
    }

    /// Wrap the head into a body reader, releasing immediately when the
    /// response has no body.
    fn finish_response(
        mut self,
        head: ResponseHead,
        is_head: bool,
        informational: Vec<u16>,
        release: Box<dyn ConnRelease>,
        deadline: Option<Instant>,
    ) -> Result<(ResponseHead, H1BodyReader, Vec<u16>), Error> {
        if head.headers.has_token("connection", "close") {
            self.reusable = false;
        }
        let mode = if is_head { BodyMode::None } else { body_mode_for(head.status, &head.headers) };
        if matches!(mode, BodyMode::UntilClose) {
            self.reusable = false;
        }
        self.parser.set_body_mode(mode);

        if self.parser.is_complete() {
            let reusable = self.reusable;
            release.release(if reusable { Some(self) } else { None });
            let reader = H1BodyReader::finished();
            return Ok((head, reader, informational));
        }
        let reader = H1BodyReader {
            conn: Some(self),
            sink: BodySink::default(),
            done: false,
            release: Some(release),
            deadline,
        };
        Ok((head, reader, informational))
    }

    /// Stream the request body, watching for an early response. Returns
    /// true when response bytes arrived before the body finished (the send
    /// is then aborted).
    async fn send_body(&mut self, request: &mut Request, deadline: Option<Instant>) -> Result<bool, Error> {
        let chunked = request.body.known_len().is_none();
        let Self { read, write, buf, .. } = self;

        let mut chunks = BodyChunks::new(&mut request.body);
        loop {
            let Some(chunk) = chunks.next()? else { break };
            if chunk.is_empty() {
                continue;
            }
            let framed = if chunked {
                let mut framed = Vec::with_capacity(chunk.len() + 16);
                framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                framed.extend_from_slice(&chunk);
                framed.extend_from_slice(b"\r\n");
                Bytes::from(framed)
            } else {
                chunk
            };
            tokio::select! {
                biased;
                r = read.read_buf(buf.inner()) => {
                    return match r {
                        Ok(0) => Err(Error::closed("connection closed during request body")),
                        Ok(_) => Ok(true),
                        Err(e) => Err(Error::connection("read during request body", e)),
                    };
                }
                r = write_all_checked(write, &framed, deadline) => {
                    r?;
                }
            }
        }
        if chunked {
            write_all_checked(write, b"0\r\n\r\n", deadline).await?;
        }
        write.flush().await.map_err(|e| Error::connection("flush request", e))?;
        Ok(false)
    }

    async fn write_all_deadline(&mut self, data: &[u8], deadline: Option<Instant>) -> Result<(), Error> {
        write_all_checked(&mut self.write, data, deadline).await?;
        self.write
            .flush()
            .await
            .map_err(|e| Error::connection("flush request head", e))
    }

    /// Read until a full response head is buffered.
    async fn read_head(&mut self, deadline: Option<Instant>) -> Result<ResponseHead, Error> {
        loop {
            if let Some(head) = self.parser.receive_head(self.buf.inner())? {
                return Ok(head);
            }
            if self.read_some(deadline).await? == 0 {
                return Err(Error::closed("connection closed before response head"));
            }
        }
    }

    /// One socket read into the parse buffer, honoring read timeout and the
    /// overall deadline.
    async fn read_some(&mut self, deadline: Option<Instant>) -> Result<usize, Error> {
        let limit = effective_timeout(self.read_timeout, deadline)?;
        let read = self.read.read_buf(self.buf.inner());
        let n = match limit {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| Error::read_timeout(limit))?,
            None => read.await,
        };
        n.map_err(|e| Error::connection("socket read", e))
    }
}

impl std::fmt::Debug for H1Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Connection")
            .field("id", &self.meta.id)
            .field("reusable", &self.reusable)
            .field("request_count", &self.meta.request_count)
            .finish()
    }
}

/// Lazy reader for an HTTP/1.1 response body. Owns the connection while the
/// body is pending; completing the body returns the connection to the pool,
/// dropping mid-body marks it Broken.
pub struct H1BodyReader {
    conn: Option<H1Connection>,
    sink: BodySink,
    done: bool,
    release: Option<Box<dyn ConnRelease>>,
    deadline: Option<Instant>,
}

impl H1BodyReader {
    fn finished() -> Self {
        Self { conn: None, sink: BodySink::default(), done: true, release: None, deadline: None }
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        if self.done && !self.sink.trailers.is_empty() {
            Some(&self.sink.trailers)
        } else {
            None
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(chunk) = self.sink.chunks.pop_front() {
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }

            let parsed = {
                let conn = self.conn.as_mut().expect("connection held until body ends");
                conn.parser.receive_body(conn.buf.inner(), &mut self.sink)
            };
            if let Err(e) = parsed {
                self.fail();
                return Err(e);
            }
            if self.sink.complete {
                self.finish();
                continue;
            }
            if !self.sink.chunks.is_empty() {
                continue;
            }

            let deadline = self.deadline;
            let read = {
                let conn = self.conn.as_mut().expect("connection held until body ends");
                conn.read_some(deadline).await
            };
            match read {
                Ok(0) => {
                    let eof = {
                        let conn = self.conn.as_mut().expect("connection held until body ends");
                        conn.parser.signal_eof(&mut self.sink)
                    };
                    match eof {
                        Ok(()) => self.finish(),
                        Err(e) => {
                            self.fail();
                            return Err(e);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }
    }

    /// Read and discard the rest of the body so the connection can be
    /// reused.
    pub async fn drain(&mut self) -> Result<(), Error> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }

    fn finish(&mut self) {
        self.done = true;
        let conn = self.conn.take();
        if let Some(release) = self.release.take() {
            match conn {
                Some(conn) if conn.reusable => release.release(Some(conn)),
                _ => release.release(None),
            }
        }
    }

    fn fail(&mut self) {
        self.done = true;
        self.conn = None;
        if let Some(release) = self.release.take() {
            release.release(None);
        }
    }
}

impl Drop for H1BodyReader {
    fn drop(&mut self) {
        if !self.done {
            // Mid-body abandonment: the connection cannot be reused.
            self.conn = None;
            if let Some(release) = self.release.take() {
                release.release(None);
            }
        }
    }
}

impl std::fmt::Debug for H1BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1BodyReader").field("done", &self.done).finish_non_exhaustive()
    }
}

/// Iterator-style adapter over the three body variants.
struct BodyChunks<'a> {
    body: &'a mut Body,
    bytes_taken: bool,
}

impl<'a> BodyChunks<'a> {
    fn new(body: &'a mut Body) -> Self {
        Self { body, bytes_taken: false }
    }

    fn next(&mut self) -> Result<Option<Bytes>, Error> {
        match self.body {
            Body::Empty => Ok(None),
            Body::Bytes(data) => {
                if self.bytes_taken {
                    Ok(None)
                } else {
                    self.bytes_taken = true;
                    Ok(Some(data.clone()))
                }
            }
            Body::Stream { source, .. } => source
                .next_chunk()
                .map_err(|e| Error::connection("request body stream", e)),
        }
    }
}

/// Canonical request head: request line, Host first when injected, then the
/// caller's headers with canonical casing, then body framing.
pub fn encode_head(request: &Request, authority: &str) -> String {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method.as_str(), request.request_target());
    if !request.headers.contains("host") {
        head.push_str("Host: ");
        head.push_str(authority);
        head.push_str("\r\n");
    }
    for (name, value) in request.headers.iter() {
        head.push_str(&canonical_name(name));
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    let needs_length = !matches!(request.body, Body::Empty)
        || matches!(request.method, Method::Post | Method::Put | Method::Patch);
    if !request.headers.contains("content-length") && !request.headers.contains("transfer-encoding") {
        match request.body.known_len() {
            Some(len) if needs_length => {
                head.push_str(&format!("Content-Length: {len}\r\n"));
            }
            Some(_) => {}
            None => head.push_str("Transfer-Encoding: chunked\r\n"),
        }
    }
    head.push_str("\r\n");
    head
}

/// Title-case a header name per canonical HTTP/1.1 form.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper_next = c == '-';
    }
    out
}

/// Body framing from the response head. The caller handles HEAD separately
/// (it forces BodyMode::None regardless of headers).
fn body_mode_for(status: u16, headers: &HeaderMap) -> BodyMode {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyMode::None;
    }
    if headers.has_token("transfer-encoding", "chunked") {
        return BodyMode::Chunked;
    }
    match headers.content_length() {
        Some(n) => BodyMode::Length(n),
        None => BodyMode::UntilClose,
    }
}

async fn write_all_checked(
    write: &mut WriteHalf<HttpStream>,
    data: &[u8],
    deadline: Option<Instant>,
) -> Result<(), Error> {
    let limit = effective_timeout(None, deadline)?;
    let fut = write.write_all(data);
    let r = match limit {
        Some(limit) => timeout(limit, fut).await.map_err(|_| Error::cancelled())?,
        None => fut.await,
    };
    r.map_err(|e| Error::connection("socket write", e))
}

/// Smaller of the read timeout and the time left until the deadline.
/// Cancelled once the deadline has passed.
fn effective_timeout(
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<Option<Duration>, Error> {
    let until_deadline = match deadline {
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(Error::cancelled());
            }
            Some(d - now)
        }
        None => None,
    };
    Ok(match (read_timeout, until_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}
