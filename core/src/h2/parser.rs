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

//! HTTP/2 frame push parser: consumes complete frames from the read buffer
//! and dispatches them to a `FrameHandler`. Malformed framing is a
//! connection error; the reader loop tears the connection down in response.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;

use super::frame::*;

/// Callbacks for each frame the client cares about. PRIORITY and unknown
/// frame types are ignored at the parser level.
pub trait FrameHandler {
    fn on_data(&mut self, stream_id: u32, end_stream: bool, data: Bytes) -> Result<(), Error>;
    #[allow(clippy::too_many_arguments)]
    fn on_headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        fragment: Bytes,
    ) -> Result<(), Error>;
    fn on_continuation(
        &mut self,
        stream_id: u32,
        end_headers: bool,
        fragment: Bytes,
    ) -> Result<(), Error>;
    fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) -> Result<(), Error>;
    fn on_settings(&mut self, ack: bool, settings: Vec<(u16, u32)>) -> Result<(), Error>;
    fn on_push_promise(&mut self, stream_id: u32, promised_id: u32) -> Result<(), Error>;
    fn on_ping(&mut self, ack: bool, opaque: u64) -> Result<(), Error>;
    fn on_goaway(&mut self, last_stream_id: u32, error_code: u32, debug: Bytes)
        -> Result<(), Error>;
    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Error>;
}

/// Push parser over the connection read buffer.
pub struct FrameParser {
    max_frame_size: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self { max_frame_size: DEFAULT_MAX_FRAME_SIZE }
    }

    /// Applied when our SETTINGS advertising a larger size is acked; until
    /// then peers must stay within the default.
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE);
    }

    /// Consume as many complete frames as `buf` holds. Partial frames stay
    /// in the buffer for the next read.
    pub fn receive<H: FrameHandler>(&mut self, buf: &mut BytesMut, handler: &mut H) -> Result<(), Error> {
        while buf.len() >= FRAME_HEADER_LEN {
            let length = (buf[0] as usize) << 16 | (buf[1] as usize) << 8 | buf[2] as usize;
            if length > self.max_frame_size {
                return Err(Error::protocol(format!(
                    "frame of {length} bytes exceeds max {}",
                    self.max_frame_size
                )));
            }
            if buf.len() < FRAME_HEADER_LEN + length {
                return Ok(());
            }
            let frame_type = buf[3];
            let flags = buf[4];
            let stream_id = ((buf[5] & 0x7f) as u32) << 24
                | (buf[6] as u32) << 16
                | (buf[7] as u32) << 8
                | buf[8] as u32;
            buf.advance(FRAME_HEADER_LEN);
            let payload = buf.split_to(length).freeze();
            self.dispatch(frame_type, flags, stream_id, payload, handler)?;
        }
        Ok(())
    }

    fn dispatch<H: FrameHandler>(
        &mut self,
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
        handler: &mut H,
    ) -> Result<(), Error> {
        match frame_type {
            TYPE_DATA => parse_data(flags, stream_id, payload, handler),
            TYPE_HEADERS => parse_headers(flags, stream_id, payload, handler),
            TYPE_CONTINUATION => {
                if stream_id == 0 {
                    return Err(Error::protocol("CONTINUATION on stream 0"));
                }
                handler.on_continuation(stream_id, flags & FLAG_END_HEADERS != 0, payload)
            }
            TYPE_RST_STREAM => {
                if stream_id == 0 {
                    return Err(Error::protocol("RST_STREAM on stream 0"));
                }
                if payload.len() != 4 {
                    return Err(Error::protocol("RST_STREAM length must be 4"));
                }
                handler.on_rst_stream(stream_id, read_u32(&payload))
            }
            TYPE_SETTINGS => parse_settings(flags, stream_id, payload, handler),
            TYPE_PUSH_PROMISE => {
                if payload.len() < 4 {
                    return Err(Error::protocol("PUSH_PROMISE too short"));
                }
                let promised = read_u32(&payload) & 0x7fff_ffff;
                handler.on_push_promise(stream_id, promised)
            }
            TYPE_PING => {
                if stream_id != 0 {
                    return Err(Error::protocol("PING on non-zero stream"));
                }
                if payload.len() != 8 {
                    return Err(Error::protocol("PING length must be 8"));
                }
                let mut p = payload;
                handler.on_ping(flags & FLAG_ACK != 0, p.get_u64())
            }
            TYPE_GOAWAY => {
                if stream_id != 0 {
                    return Err(Error::protocol("GOAWAY on non-zero stream"));
                }
                if payload.len() < 8 {
                    return Err(Error::protocol("GOAWAY too short"));
                }
                let mut p = payload;
                let last = p.get_u32() & 0x7fff_ffff;
                let code = p.get_u32();
                handler.on_goaway(last, code, p)
            }
            TYPE_WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(Error::protocol("WINDOW_UPDATE length must be 4"));
                }
                let increment = read_u32(&payload) & 0x7fff_ffff;
                if increment == 0 {
                    return Err(Error::protocol("WINDOW_UPDATE of zero"));
                }
                handler.on_window_update(stream_id, increment)
            }
            // PRIORITY carries no client-visible state; unknown types are
            // ignored per RFC 7540 §4.1.
            _ => Ok(()),
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_data<H: FrameHandler>(
    flags: u8,
    stream_id: u32,
    mut payload: Bytes,
    handler: &mut H,
) -> Result<(), Error> {
    if stream_id == 0 {
        return Err(Error::protocol("DATA on stream 0"));
    }
    let data = if flags & FLAG_PADDED != 0 {
        if payload.is_empty() {
            return Err(Error::protocol("padded DATA without pad length"));
        }
        let pad = payload.get_u8() as usize;
        if pad > payload.len() {
            return Err(Error::protocol("DATA padding exceeds payload"));
        }
        payload.split_to(payload.len() - pad)
    } else {
        payload
    };
    handler.on_data(stream_id, flags & FLAG_END_STREAM != 0, data)
}

fn parse_headers<H: FrameHandler>(
    flags: u8,
    stream_id: u32,
    mut payload: Bytes,
    handler: &mut H,
) -> Result<(), Error> {
    if stream_id == 0 {
        return Err(Error::protocol("HEADERS on stream 0"));
    }
    let pad = if flags & FLAG_PADDED != 0 {
        if payload.is_empty() {
            return Err(Error::protocol("padded HEADERS without pad length"));
        }
        payload.get_u8() as usize
    } else {
        0
    };
    if flags & FLAG_PRIORITY != 0 {
        if payload.len() < 5 {
            return Err(Error::protocol("HEADERS priority fields truncated"));
        }
        payload.advance(5);
    }
    if pad > payload.len() {
        return Err(Error::protocol("HEADERS padding exceeds payload"));
    }
    let fragment = payload.split_to(payload.len() - pad);
    handler.on_headers(
        stream_id,
        flags & FLAG_END_STREAM != 0,
        flags & FLAG_END_HEADERS != 0,
        fragment,
    )
}

fn parse_settings<H: FrameHandler>(
    flags: u8,
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), Error> {
    if stream_id != 0 {
        return Err(Error::protocol("SETTINGS on non-zero stream"));
    }
    let ack = flags & FLAG_ACK != 0;
    if ack {
        if !payload.is_empty() {
            return Err(Error::protocol("SETTINGS ack with payload"));
        }
        return handler.on_settings(true, Vec::new());
    }
    if payload.len() % 6 != 0 {
        return Err(Error::protocol("SETTINGS length not a multiple of 6"));
    }
    let mut p = payload;
    let mut settings = Vec::with_capacity(p.len() / 6);
    while p.has_remaining() {
        settings.push((p.get_u16(), p.get_u32()));
    }
    handler.on_settings(false, settings)
}

fn read_u32(payload: &Bytes) -> u32 {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}
