/*
 * parser.rs
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

//! Streaming HTTP/1.1 response parser. Feed bytes as they arrive: the head
//! phase yields status line + headers, then the connection decides the body
//! framing (Content-Length, chunked, read-until-close, or none) and the body
//! phase emits zero-copy chunks into a sink. Partial input stays in the
//! buffer between calls.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;
use crate::headers::HeaderMap;

/// Cap on accumulated status line + header bytes.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Parsed status line and headers.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Body framing, decided by the connection from the head and request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body follows (HEAD, 1xx/204/304, Content-Length: 0).
    None,
    Length(u64),
    Chunked,
    /// Body runs until the peer closes the connection.
    UntilClose,
}

/// Destination for body-phase output.
#[derive(Debug, Default)]
pub struct BodySink {
    pub chunks: VecDeque<Bytes>,
    pub trailers: HeaderMap,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StatusLine,
    Headers,
    /// Head delivered; waiting for the connection to pick a BodyMode.
    AwaitBodyMode,
    Body,
    ChunkSize,
    ChunkData,
    /// CRLF after a chunk's data.
    ChunkDataEnd,
    Trailers,
    Complete,
}

/// Push parser for one HTTP/1.1 response. Reusable across responses on the
/// same connection via `reset`.
pub struct ResponseParser {
    phase: Phase,
    head_bytes_seen: usize,
    partial_status: u16,
    partial_reason: String,
    partial_headers: HeaderMap,
    body_remaining: u64,
    until_close: bool,
    chunk_remaining: u64,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::StatusLine,
            head_bytes_seen: 0,
            partial_status: 0,
            partial_reason: String::new(),
            partial_headers: HeaderMap::new(),
            body_remaining: 0,
            until_close: false,
            chunk_remaining: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// True in the window between a delivered head and `set_body_mode`.
    pub fn awaiting_body_mode(&self) -> bool {
        self.phase == Phase::AwaitBodyMode
    }

    /// True once body parsing has started (a mid-body connection loss is
    /// then unrecoverable for reuse).
    pub fn in_body(&self) -> bool {
        matches!(
            self.phase,
            Phase::Body | Phase::ChunkSize | Phase::ChunkData | Phase::ChunkDataEnd | Phase::Trailers
        )
    }

    /// Consume head bytes from `buf`. Returns the head once the blank line
    /// is reached, or None when more input is needed. To skip an
    /// informational response, call `reset` and parse again.
    pub fn receive_head(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseHead>, Error> {
        loop {
            match self.phase {
                Phase::StatusLine => {
                    let Some(line) = self.take_line(buf)? else { return Ok(None) };
                    let line = std::str::from_utf8(&line)
                        .map_err(|_| Error::protocol("status line is not UTF-8"))?;
                    let mut parts = line.splitn(3, ' ');
                    let version = parts.next().unwrap_or("");
                    if !version.starts_with("HTTP/1.") {
                        return Err(Error::protocol(format!("unsupported version {version:?}")));
                    }
                    let code = parts
                        .next()
                        .and_then(|s| s.parse::<u16>().ok())
                        .filter(|c| (100..=599).contains(c))
                        .ok_or_else(|| Error::protocol(format!("bad status line {line:?}")))?;
                    self.partial_status = code;
                    self.partial_reason = parts.next().unwrap_or("").to_string();
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let Some(line) = self.take_line(buf)? else { return Ok(None) };
                    if line.is_empty() {
                        self.phase = Phase::AwaitBodyMode;
                        let head = ResponseHead {
                            status: self.partial_status,
                            reason: std::mem::take(&mut self.partial_reason),
                            headers: std::mem::take(&mut self.partial_headers),
                        };
                        return Ok(Some(head));
                    }
                    let (name, value) = split_header_line(&line)?;
                    self.partial_headers.append(name, value);
                }
                _ => return Err(Error::protocol("receive_head called in body phase")),
            }
        }
    }

    /// Choose the body framing after the head was delivered.
    pub fn set_body_mode(&mut self, mode: BodyMode) {
        debug_assert_eq!(self.phase, Phase::AwaitBodyMode);
        match mode {
            BodyMode::None => self.phase = Phase::Complete,
            BodyMode::Length(0) => self.phase = Phase::Complete,
            BodyMode::Length(n) => {
                self.body_remaining = n;
                self.until_close = false;
                self.phase = Phase::Body;
            }
            BodyMode::Chunked => self.phase = Phase::ChunkSize,
            BodyMode::UntilClose => {
                self.until_close = true;
                self.phase = Phase::Body;
            }
        }
    }

    /// Consume body bytes from `buf` into `sink`. Chunks are zero-copy
    /// views of the parse buffer.
    pub fn receive_body(&mut self, buf: &mut BytesMut, sink: &mut BodySink) -> Result<(), Error> {
        loop {
            match self.phase {
                Phase::Body => {
                    if self.until_close {
                        if !buf.is_empty() {
                            let len = buf.len();
                            sink.chunks.push_back(buf.split_to(len).freeze());
                        }
                        return Ok(());
                    }
                    if self.body_remaining > 0 && !buf.is_empty() {
                        let take = (self.body_remaining as usize).min(buf.len());
                        sink.chunks.push_back(buf.split_to(take).freeze());
                        self.body_remaining -= take as u64;
                    }
                    if self.body_remaining == 0 {
                        self.phase = Phase::Complete;
                        sink.complete = true;
                    }
                    return Ok(());
                }
                Phase::ChunkSize => {
                    let Some(line) = self.take_line(buf)? else { return Ok(()) };
                    let line = std::str::from_utf8(&line)
                        .map_err(|_| Error::protocol("chunk size line is not UTF-8"))?;
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_part, 16)
                        .map_err(|_| Error::protocol(format!("bad chunk size {size_part:?}")))?;
                    if size == 0 {
                        self.phase = Phase::Trailers;
                    } else {
                        self.chunk_remaining = size;
                        self.phase = Phase::ChunkData;
                    }
                }
                Phase::ChunkData => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let take = (self.chunk_remaining as usize).min(buf.len());
                    sink.chunks.push_back(buf.split_to(take).freeze());
                    self.chunk_remaining -= take as u64;
                    if self.chunk_remaining == 0 {
                        self.phase = Phase::ChunkDataEnd;
                    }
                }
                Phase::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::protocol("chunk data not followed by CRLF"));
                    }
                    buf.advance(2);
                    self.phase = Phase::ChunkSize;
                }
                Phase::Trailers => {
                    let Some(line) = self.take_line(buf)? else { return Ok(()) };
                    if line.is_empty() {
                        self.phase = Phase::Complete;
                        sink.complete = true;
                        return Ok(());
                    }
                    let (name, value) = split_header_line(&line)?;
                    sink.trailers.append(name, value);
                }
                Phase::Complete => return Ok(()),
                _ => return Err(Error::protocol("receive_body called before body phase")),
            }
        }
    }

    /// The peer closed the connection. Legal end only for read-until-close
    /// bodies.
    pub fn signal_eof(&mut self, sink: &mut BodySink) -> Result<(), Error> {
        match self.phase {
            Phase::Body if self.until_close => {
                self.phase = Phase::Complete;
                sink.complete = true;
                Ok(())
            }
            Phase::Complete => Ok(()),
            _ => Err(Error::closed("connection closed mid-response")),
        }
    }

    /// Take one CRLF-terminated line (without the CRLF), or None if
    /// incomplete. Enforces the head size cap.
    fn take_line(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        let Some(pos) = find_crlf(buf) else {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(Error::protocol("header section exceeds 64K"));
            }
            return Ok(None);
        };
        self.head_bytes_seen += pos + 2;
        if self.head_bytes_seen > MAX_HEAD_BYTES && !self.in_body() {
            return Err(Error::protocol("header section exceeds 64K"));
        }
        let line = buf.split_to(pos).freeze();
        buf.advance(2);
        Ok(Some(line))
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn split_header_line(line: &Bytes) -> Result<(String, String), Error> {
    let line = std::str::from_utf8(line).map_err(|_| Error::protocol("header is not UTF-8"))?;
    let colon = line
        .find(':')
        .ok_or_else(|| Error::protocol(format!("header line without colon: {line:?}")))?;
    let name = line[..colon].trim();
    if name.is_empty() {
        return Err(Error::protocol("empty header name"));
    }
    Ok((name.to_string(), line[colon + 1..].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn parses_head_then_fixed_body() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello");
        let head = p.receive_head(&mut buf).unwrap().expect("head complete");
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("x-a"), Some("b"));

        p.set_body_mode(BodyMode::Length(5));
        let mut sink = BodySink::default();
        p.receive_body(&mut buf, &mut sink).unwrap();
        assert!(sink.complete);
        assert_eq!(&sink.chunks.pop_front().unwrap()[..], b"hello");
        assert!(p.is_complete());
    }

    #[test]
    fn head_across_partial_reads() {
        let mut p = ResponseParser::new();
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Co"[..]);
        assert!(p.receive_head(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ntent\r\n\r\n");
        let head = p.receive_head(&mut buf).unwrap().expect("head");
        assert_eq!(head.status, 204);
        assert_eq!(head.reason, "No Content");
        p.set_body_mode(BodyMode::None);
        assert!(p.is_complete());
    }

    #[test]
    fn zero_content_length_completes_immediately() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        p.receive_head(&mut buf).unwrap().expect("head");
        p.set_body_mode(BodyMode::Length(0));
        assert!(p.is_complete());
    }

    #[test]
    fn chunked_body_with_trailers() {
        let mut p = ResponseParser::new();
        let mut buf = wire(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Sum: ab\r\n\r\n",
        );
        p.receive_head(&mut buf).unwrap().expect("head");
        p.set_body_mode(BodyMode::Chunked);
        let mut sink = BodySink::default();
        p.receive_body(&mut buf, &mut sink).unwrap();
        assert!(sink.complete);
        let body: Vec<u8> = sink.chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(sink.trailers.get("x-sum"), Some("ab"));
    }

    #[test]
    fn chunked_terminator_only() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 200 OK\r\n\r\n0\r\n\r\n");
        p.receive_head(&mut buf).unwrap().expect("head");
        p.set_body_mode(BodyMode::Chunked);
        let mut sink = BodySink::default();
        p.receive_body(&mut buf, &mut sink).unwrap();
        assert!(sink.complete);
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn bad_chunk_size_is_a_protocol_error() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 200 OK\r\n\r\nzz\r\n");
        p.receive_head(&mut buf).unwrap().expect("head");
        p.set_body_mode(BodyMode::Chunked);
        let mut sink = BodySink::default();
        assert!(p.receive_body(&mut buf, &mut sink).is_err());
    }

    #[test]
    fn until_close_body_ends_on_eof() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 200 OK\r\n\r\nsome data");
        p.receive_head(&mut buf).unwrap().expect("head");
        p.set_body_mode(BodyMode::UntilClose);
        let mut sink = BodySink::default();
        p.receive_body(&mut buf, &mut sink).unwrap();
        assert!(!sink.complete);
        p.signal_eof(&mut sink).unwrap();
        assert!(sink.complete);
    }

    #[test]
    fn eof_mid_fixed_body_is_an_error() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        p.receive_head(&mut buf).unwrap().expect("head");
        p.set_body_mode(BodyMode::Length(10));
        let mut sink = BodySink::default();
        p.receive_body(&mut buf, &mut sink).unwrap();
        assert!(!sink.complete);
        assert!(p.signal_eof(&mut sink).is_err());
    }

    #[test]
    fn informational_head_can_be_reset() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n\r\n");
        let head = p.receive_head(&mut buf).unwrap().expect("informational head");
        assert_eq!(head.status, 100);
        p.reset();
        let head = p.receive_head(&mut buf).unwrap().expect("final head");
        assert_eq!(head.status, 200);
    }

    #[test]
    fn garbage_status_line_rejected() {
        let mut p = ResponseParser::new();
        let mut buf = wire(b"ICY 200 OK\r\n\r\n");
        assert!(p.receive_head(&mut buf).is_err());
    }
}
