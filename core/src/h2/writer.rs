/*
 * writer.rs
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

//! HTTP/2 frame serializer. Accumulates frames in a buffer which the writer
//! loop drains to the socket. Header blocks larger than the peer's max
//! frame size are emitted as HEADERS plus CONTINUATION frames, always
//! contiguously.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::*;

/// Serializes frames into an internal buffer.
pub struct FrameWriter {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE + FRAME_HEADER_LEN),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Peer's SETTINGS_MAX_FRAME_SIZE; bounds DATA payloads and header
    /// block fragments.
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE);
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn frame_header(&mut self, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
        debug_assert!(length <= self.max_frame_size);
        self.buf.put_u8((length >> 16) as u8);
        self.buf.put_u8((length >> 8) as u8);
        self.buf.put_u8(length as u8);
        self.buf.put_u8(frame_type);
        self.buf.put_u8(flags);
        self.buf.put_u32(stream_id & 0x7fff_ffff);
    }

    /// The client connection preface (before the first SETTINGS).
    pub fn preface(&mut self) {
        self.buf.extend_from_slice(CLIENT_PREFACE);
    }

    /// One DATA frame. The caller keeps payloads within flow-control
    /// windows and the max frame size.
    pub fn data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        debug_assert_ne!(stream_id, 0);
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.frame_header(data.len(), TYPE_DATA, flags, stream_id);
        self.buf.extend_from_slice(data);
    }

    /// A complete header block: HEADERS plus as many CONTINUATION frames as
    /// the block needs, back to back.
    pub fn header_block(&mut self, stream_id: u32, block: &[u8], end_stream: bool) {
        debug_assert_ne!(stream_id, 0);
        let first_len = block.len().min(self.max_frame_size);
        let (first, mut rest) = block.split_at(first_len);
        let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };
        if rest.is_empty() {
            flags |= FLAG_END_HEADERS;
        }
        self.frame_header(first.len(), TYPE_HEADERS, flags, stream_id);
        self.buf.extend_from_slice(first);

        while !rest.is_empty() {
            let take = rest.len().min(self.max_frame_size);
            let (chunk, tail) = rest.split_at(take);
            let flags = if tail.is_empty() { FLAG_END_HEADERS } else { 0 };
            self.frame_header(chunk.len(), TYPE_CONTINUATION, flags, stream_id);
            self.buf.extend_from_slice(chunk);
            rest = tail;
        }
    }

    /// Single HEADERS frame (tests use this; production paths go through
    /// `header_block`).
    pub fn headers(&mut self, stream_id: u32, fragment: &[u8], end_stream: bool, end_headers: bool) {
        let mut flags = 0;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        if end_headers {
            flags |= FLAG_END_HEADERS;
        }
        self.frame_header(fragment.len(), TYPE_HEADERS, flags, stream_id);
        self.buf.extend_from_slice(fragment);
    }

    pub fn rst_stream(&mut self, stream_id: u32, error_code: u32) {
        debug_assert_ne!(stream_id, 0);
        self.frame_header(4, TYPE_RST_STREAM, 0, stream_id);
        self.buf.put_u32(error_code);
    }

    pub fn settings(&mut self, settings: &[(u16, u32)]) {
        self.frame_header(settings.len() * 6, TYPE_SETTINGS, 0, 0);
        for &(id, value) in settings {
            self.buf.put_u16(id);
            self.buf.put_u32(value);
        }
    }

    pub fn settings_ack(&mut self) {
        self.frame_header(0, TYPE_SETTINGS, FLAG_ACK, 0);
    }

    pub fn ping(&mut self, opaque: u64, ack: bool) {
        let flags = if ack { FLAG_ACK } else { 0 };
        self.frame_header(8, TYPE_PING, flags, 0);
        self.buf.put_u64(opaque);
    }

    pub fn goaway(&mut self, last_stream_id: u32, error_code: u32, debug: &[u8]) {
        self.frame_header(8 + debug.len(), TYPE_GOAWAY, 0, 0);
        self.buf.put_u32(last_stream_id & 0x7fff_ffff);
        self.buf.put_u32(error_code);
        self.buf.extend_from_slice(debug);
    }

    /// WINDOW_UPDATE for a stream, or the connection when `stream_id` is 0.
    pub fn window_update(&mut self, stream_id: u32, increment: u32) {
        debug_assert!(increment > 0 && increment <= MAX_WINDOW);
        self.frame_header(4, TYPE_WINDOW_UPDATE, 0, stream_id);
        self.buf.put_u32(increment & 0x7fff_ffff);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain the accumulated bytes for writing to the socket.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_is_wire_exact() {
        let mut w = FrameWriter::new();
        w.preface();
        assert_eq!(&w.take()[..], b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");
    }

    #[test]
    fn header_block_fits_single_frame() {
        let mut w = FrameWriter::new();
        w.header_block(1, b"abc", true);
        let wire = w.take();
        assert_eq!(wire[3], TYPE_HEADERS);
        assert_eq!(wire[4], FLAG_END_STREAM | FLAG_END_HEADERS);
    }

    #[test]
    fn oversized_header_block_uses_continuations() {
        let mut w = FrameWriter::new();
        let block = vec![0x55u8; DEFAULT_MAX_FRAME_SIZE + 100];
        w.header_block(1, &block, false);
        let wire = w.take();
        // First frame: HEADERS, full size, no END_HEADERS.
        assert_eq!(wire[3], TYPE_HEADERS);
        assert_eq!(wire[4] & FLAG_END_HEADERS, 0);
        // Second frame starts right after.
        let second = FRAME_HEADER_LEN + DEFAULT_MAX_FRAME_SIZE;
        assert_eq!(wire[second + 3], TYPE_CONTINUATION);
        assert_eq!(wire[second + 4] & FLAG_END_HEADERS, FLAG_END_HEADERS);
    }

    #[test]
    fn take_leaves_writer_reusable() {
        let mut w = FrameWriter::new();
        w.ping(1, false);
        assert!(!w.is_empty());
        let first = w.take();
        assert!(w.is_empty());
        w.ping(2, true);
        let second = w.take();
        assert_ne!(first, second);
    }
}
