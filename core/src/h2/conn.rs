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

//! Multiplexed HTTP/2 client connection. Two spawned loops own the socket:
//! a reader that demultiplexes frames onto per-stream bounded channels and
//! handles connection-level frames, and a writer that drains a command
//! queue, owns the HPACK encoder, and never interleaves a header block with
//! other frames. Send-side flow control is reservation-based: a stream
//! reserves window credit from shared state before queueing DATA, and
//! suspends until WINDOW_UPDATE replenishes it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;

use crate::bufpool::{BufferPool, PooledBuf};
use crate::conn::ConnMeta;
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::hpack::{HpackDecoder, HpackEncoder, DEFAULT_HEADER_TABLE_SIZE};
use crate::net::HttpStream;
use crate::request::{Body, Method, Request};

use super::frame::*;
use super::parser::{FrameHandler, FrameParser};
use super::writer::FrameWriter;

/// Peer max-concurrent-streams assumed until its SETTINGS arrive.
const DEFAULT_MAX_CONCURRENT: u32 = 100;
/// Capacity of the writer command queue and per-stream event channels.
const CHANNEL_CAPACITY: usize = 64;
/// Liveness probe timing.
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands consumed by the writer loop, in order.
enum Cmd {
    Open { id: u32, fields: Vec<(String, String)>, end_stream: bool },
    Data { id: u32, data: Bytes, end_stream: bool },
    Rst { id: u32, code: u32 },
    /// Replenish the peer's view of our receive window.
    WindowUpdateOut { id: u32, increment: u32 },
    ApplyPeerSettings(Vec<(u16, u32)>),
    Ping { opaque: u64 },
    Pong { opaque: u64 },
    Goaway { code: u32 },
}

/// Events delivered to a stream's owner.
enum StreamEvent {
    Headers { headers: HeaderMap, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers { headers: HeaderMap },
    Reset { code: u32 },
    /// GOAWAY promised this stream was never processed.
    NotProcessed,
    ConnError { detail: String },
}

struct StreamEntry {
    events_tx: mpsc::Sender<StreamEvent>,
    /// Peer's credit for our DATA on this stream.
    send_window: i64,
    local_done: bool,
    remote_done: bool,
    /// Response headers seen; later HEADERS are trailers.
    saw_headers: bool,
}

struct MuxState {
    next_stream_id: u32,
    active: HashMap<u32, StreamEntry>,
    max_concurrent: u32,
    conn_send_window: i64,
    initial_send_window: i64,
    goaway_last_id: Option<u32>,
    closing: bool,
    broken: Option<String>,
    admission_waiters: VecDeque<oneshot::Sender<()>>,
}

impl MuxState {
    fn accepts_streams(&self) -> Result<(), Error> {
        if let Some(detail) = &self.broken {
            return Err(Error::unavailable(format!("connection broken: {detail}")));
        }
        if self.closing || self.goaway_last_id.is_some() {
            return Err(Error::unavailable("connection closing"));
        }
        if self.next_stream_id > STREAM_ID_RETIRE_THRESHOLD {
            return Err(Error::unavailable("stream id space exhausted"));
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<MuxState>,
    meta: Mutex<ConnMeta>,
    cmd_tx: mpsc::Sender<Cmd>,
    /// Woken when window credit is replenished.
    window_notify: Notify,
    /// One permit each; notify_one so a loop that has not yet parked still
    /// observes the shutdown.
    shutdown_reader: Notify,
    shutdown_writer: Notify,
}

impl Shared {
    /// Mark the connection Broken: fail every stream, refuse admission,
    /// stop both loops.
    fn fatal(&self, detail: &str) {
        let mut state = self.state.lock().unwrap();
        if state.broken.is_some() {
            return;
        }
        log::warn!("h2 connection broken: {detail}");
        state.broken = Some(detail.to_string());
        for (_, entry) in state.active.drain() {
            let _ = entry
                .events_tx
                .try_send(StreamEvent::ConnError { detail: detail.to_string() });
        }
        state.admission_waiters.clear();
        drop(state);
        self.window_notify.notify_waiters();
        self.shutdown_reader.notify_one();
        self.shutdown_writer.notify_one();
    }

    /// Remove a stream and hand its concurrency slot to the next waiter.
    fn remove_stream(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        if state.active.remove(&id).is_some() {
            Self::wake_one_waiter(&mut state);
        }
    }

    fn wake_one_waiter(state: &mut MuxState) {
        while let Some(waiter) = state.admission_waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
    }
}

/// Cloneable handle to one HTTP/2 connection.
#[derive(Clone)]
pub struct H2Connection {
    shared: Arc<Shared>,
}

impl H2Connection {
    /// Take ownership of a negotiated h2 transport: write the preface and
    /// our SETTINGS, then spawn the reader and writer loops.
    pub fn handshake(stream: HttpStream, bufpool: &BufferPool, keepalive: Option<Duration>) -> Self {
        let (read, write) = tokio::io::split(stream);
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            state: Mutex::new(MuxState {
                next_stream_id: 1,
                active: HashMap::new(),
                max_concurrent: DEFAULT_MAX_CONCURRENT,
                conn_send_window: DEFAULT_INITIAL_WINDOW as i64,
                initial_send_window: DEFAULT_INITIAL_WINDOW as i64,
                goaway_last_id: None,
                closing: false,
                broken: None,
                admission_waiters: VecDeque::new(),
            }),
            meta: Mutex::new(ConnMeta::new()),
            cmd_tx,
            window_notify: Notify::new(),
            shutdown_reader: Notify::new(),
            shutdown_writer: Notify::new(),
        });

        let mut frames = FrameWriter::new();
        frames.preface();
        // ENABLE_PUSH=0: we never accept pushed streams.
        frames.settings(&[(SETTINGS_ENABLE_PUSH, 0)]);
        let writer = WriterLoop {
            write,
            cmd_rx,
            frames,
            encoder: HpackEncoder::new(DEFAULT_HEADER_TABLE_SIZE),
            shared: shared.clone(),
        };
        tokio::spawn(writer.run());

        let reader = ReaderLoop {
            read,
            buf: bufpool.acquire(32 * 1024),
            parser: FrameParser::new(),
            state: ReaderState {
                shared: shared.clone(),
                decoder: HpackDecoder::new(DEFAULT_HEADER_TABLE_SIZE),
                accum: None,
                pending: Vec::new(),
                got_pong: false,
            },
            keepalive: keepalive.unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
        };
        tokio::spawn(reader.run());

        Self { shared }
    }

    /// Whether new streams may be opened at all (ignores the concurrency
    /// cap, which admission waits on).
    pub fn is_usable(&self) -> bool {
        self.shared.state.lock().unwrap().accepts_streams().is_ok()
    }

    /// Usable and under the peer's concurrent-stream cap right now.
    pub fn has_capacity(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.accepts_streams().is_ok() && (state.active.len() as u32) < state.max_concurrent
    }

    pub fn active_streams(&self) -> usize {
        self.shared.state.lock().unwrap().active.len()
    }

    pub fn meta(&self) -> ConnMeta {
        self.shared.meta.lock().unwrap().clone()
    }

    /// Graceful teardown: GOAWAY, then stop accepting streams. In-flight
    /// streams finish on their own.
    pub fn close(&self) {
        self.shared.state.lock().unwrap().closing = true;
        let _ = self.shared.cmd_tx.try_send(Cmd::Goaway { code: ERROR_NO_ERROR });
    }

    /// Send one request over a new stream. Suspends (FIFO) while the peer's
    /// concurrency cap is reached.
    pub async fn send_request(
        &self,
        request: &mut Request,
        authority: &str,
        deadline: Option<Instant>,
        read_timeout: Option<Duration>,
    ) -> Result<H2ResponseHead, Error> {
        let (id, events) = self.reserve_stream(deadline).await?;
        self.shared.meta.lock().unwrap().touch();

        let mut io = StreamIo {
            id,
            shared: self.shared.clone(),
            cmd_tx: self.shared.cmd_tx.clone(),
            events,
            finished: false,
        };

        let fields = request_fields(request, authority);
        let body_empty = matches!(request.body, Body::Empty);
        io.send_cmd(Cmd::Open { id, fields, end_stream: body_empty }, deadline).await?;

        if !body_empty {
            io.send_body(&mut request.body, deadline).await?;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.active.get_mut(&id) {
                entry.local_done = true;
            }
        }

        // Response heads until a final (non-1xx) status.
        let mut informational = Vec::new();
        loop {
            match io.next_event(deadline, read_timeout).await? {
                StreamEvent::Headers { headers, end_stream } => {
                    let status = parse_status(&headers)?;
                    if (100..200).contains(&status) {
                        informational.push(status);
                        continue;
                    }
                    let mut headers = headers;
                    headers.remove(":status");
                    let mut reader = H2BodyReader {
                        io: Some(io),
                        trailers: None,
                        done: false,
                        read_timeout,
                        deadline,
                    };
                    if end_stream {
                        reader.settle();
                    }
                    return Ok(H2ResponseHead { status, headers, reader, informational });
                }
                StreamEvent::Data { .. } => {
                    return Err(Error::protocol("DATA before response HEADERS"));
                }
                StreamEvent::Trailers { .. } => {
                    return Err(Error::protocol("trailers before response HEADERS"));
                }
                other => return Err(event_error(other)),
            }
        }
    }

    /// Allocate a stream id and event channel, waiting FIFO for a slot
    /// under the peer's concurrency cap.
    async fn reserve_stream(
        &self,
        deadline: Option<Instant>,
    ) -> Result<(u32, mpsc::Receiver<StreamEvent>), Error> {
        loop {
            let waiter = {
                let mut state = self.shared.state.lock().unwrap();
                state.accepts_streams()?;
                if (state.active.len() as u32) < state.max_concurrent {
                    let id = state.next_stream_id;
                    state.next_stream_id += 2;
                    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                    let window = state.initial_send_window;
                    state.active.insert(
                        id,
                        StreamEntry {
                            events_tx: tx,
                            send_window: window,
                            local_done: false,
                            remote_done: false,
                            saw_headers: false,
                        },
                    );
                    return Ok((id, rx));
                }
                let (tx, rx) = oneshot::channel();
                state.admission_waiters.push_back(tx);
                rx
            };

            let waited = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::cancelled());
                    }
                    timeout(d - now, waiter).await.map_err(|_| Error::cancelled())?
                }
                None => waiter.await,
            };
            // A dropped waiter means the connection failed or is closing;
            // the next loop iteration reports the recorded reason.
            let _ = waited;
        }
    }
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("H2Connection")
            .field("active", &state.active.len())
            .field("max_concurrent", &state.max_concurrent)
            .field("closing", &state.closing)
            .field("broken", &state.broken)
            .finish()
    }
}

/// Result of `H2Connection::send_request`: the final head plus the lazy
/// body reader and any discarded informational statuses.
pub struct H2ResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
    pub reader: H2BodyReader,
    pub informational: Vec<u16>,
}

/// Per-stream I/O: command sender plus the event channel.
struct StreamIo {
    id: u32,
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Cmd>,
    events: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl StreamIo {
    async fn send_cmd(&self, cmd: Cmd, deadline: Option<Instant>) -> Result<(), Error> {
        let send = self.cmd_tx.send(cmd);
        let sent = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::cancelled());
                }
                timeout(d - now, send).await.map_err(|_| Error::cancelled())?
            }
            None => send.await,
        };
        sent.map_err(|_| Error::closed("h2 writer loop gone"))
    }

    /// Stream the request body, reserving flow-control credit chunk by
    /// chunk and suspending on exhausted windows.
    async fn send_body(&mut self, body: &mut Body, deadline: Option<Instant>) -> Result<(), Error> {
        match body {
            Body::Empty => Ok(()),
            Body::Bytes(data) => {
                let data = data.clone();
                self.send_data(data, true, deadline).await
            }
            Body::Stream { source, .. } => {
                let mut pending: Option<Bytes> = source
                    .next_chunk()
                    .map_err(|e| Error::connection("request body stream", e))?;
                while let Some(chunk) = pending {
                    let next = source
                        .next_chunk()
                        .map_err(|e| Error::connection("request body stream", e))?;
                    let is_last = next.is_none();
                    self.send_data(chunk, is_last, deadline).await?;
                    pending = next;
                }
                Ok(())
            }
        }
    }

    /// Reserve up to `want` bytes of send credit from the stream and
    /// connection windows. None means both are currently exhausted.
    fn try_reserve_credit(&self, want: usize) -> Result<Option<usize>, Error> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(detail) = &state.broken {
            return Err(Error::closed(format!("connection broken: {detail}")));
        }
        let stream_window = match state.active.get(&self.id) {
            Some(entry) => entry.send_window,
            None => return Err(Error::closed("stream closed while sending body")),
        };
        let available = stream_window.min(state.conn_send_window);
        if available <= 0 {
            return Ok(None);
        }
        let take = (available as usize).min(want);
        state.conn_send_window -= take as i64;
        if let Some(entry) = state.active.get_mut(&self.id) {
            entry.send_window -= take as i64;
        }
        Ok(Some(take))
    }

    async fn send_data(
        &self,
        mut data: Bytes,
        end: bool,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        if data.is_empty() {
            return self.send_cmd(Cmd::Data { id: self.id, data, end_stream: end }, deadline).await;
        }
        while !data.is_empty() {
            // Reserve credit, or suspend until a WINDOW_UPDATE. The waiter
            // is enabled before the re-check so a wakeup between the two
            // cannot be lost.
            let reserved = loop {
                if let Some(take) = self.try_reserve_credit(data.len())? {
                    break take;
                }
                let notified = self.shared.window_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(take) = self.try_reserve_credit(data.len())? {
                    break take;
                }
                match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Err(Error::cancelled());
                        }
                        timeout(d - now, notified).await.map_err(|_| Error::cancelled())?;
                    }
                    None => notified.await,
                }
            };
            let chunk = data.split_to(reserved);
            let end_stream = end && data.is_empty();
            self.send_cmd(Cmd::Data { id: self.id, data: chunk, end_stream }, deadline).await?;
        }
        Ok(())
    }

    async fn next_event(
        &mut self,
        deadline: Option<Instant>,
        read_timeout: Option<Duration>,
    ) -> Result<StreamEvent, Error> {
        let mut limit = read_timeout;
        if let Some(d) = deadline {
            let remaining = d.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::cancelled());
            }
            limit = Some(limit.map_or(remaining, |l| l.min(remaining)));
        }
        let recv = self.events.recv();
        let event = match limit {
            Some(limit) => timeout(limit, recv).await.map_err(|_| Error::read_timeout(limit))?,
            None => recv.await,
        };
        event.ok_or_else(|| Error::closed("h2 stream event channel closed"))
    }
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.cmd_tx.try_send(Cmd::Rst { id: self.id, code: ERROR_CANCEL });
            self.shared.remove_stream(self.id);
        }
    }
}

fn event_error(event: StreamEvent) -> Error {
    match event {
        StreamEvent::Reset { code } if code == ERROR_REFUSED_STREAM => {
            Error::not_processed("stream refused by peer")
        }
        StreamEvent::Reset { code } => {
            Error::protocol(format!("stream reset: {}", error_code_name(code)))
        }
        StreamEvent::NotProcessed => Error::not_processed("stream above GOAWAY last processed id"),
        StreamEvent::ConnError { detail } => Error::closed(detail),
        _ => Error::protocol("unexpected stream event"),
    }
}

/// Lazy reader for an HTTP/2 response body. Dropping it mid-stream resets
/// the stream with CANCEL; the connection itself stays healthy.
pub struct H2BodyReader {
    io: Option<StreamIo>,
    trailers: Option<HeaderMap>,
    done: bool,
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl H2BodyReader {
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.done {
            return Ok(None);
        }
        let event = {
            let io = self.io.as_mut().expect("stream held until body ends");
            io.next_event(self.deadline, self.read_timeout).await
        };
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                self.settle();
                return Err(e);
            }
        };
        match event {
            StreamEvent::Data { data, end_stream } => {
                if !data.is_empty() && !end_stream {
                    let io = self.io.as_ref().expect("stream held until body ends");
                    let update = Cmd::WindowUpdateOut { id: io.id, increment: data.len() as u32 };
                    let _ = io.cmd_tx.send(update).await;
                }
                if end_stream {
                    self.settle();
                }
                if data.is_empty() {
                    if end_stream {
                        return Ok(None);
                    }
                    return Ok(Some(data));
                }
                Ok(Some(data))
            }
            StreamEvent::Trailers { headers } => {
                self.trailers = Some(headers);
                self.settle();
                Ok(None)
            }
            StreamEvent::Headers { .. } => {
                self.settle();
                Err(Error::protocol("unexpected HEADERS after response body"))
            }
            other => {
                self.settle();
                Err(event_error(other))
            }
        }
    }

    /// Body finished (or failed): mark the stream settled so dropping the
    /// reader does not RST a completed stream.
    fn settle(&mut self) {
        self.done = true;
        if let Some(io) = self.io.as_mut() {
            if !io.finished {
                io.finished = true;
                io.shared.remove_stream(io.id);
            }
        }
    }
}

impl std::fmt::Debug for H2BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2BodyReader").field("done", &self.done).finish_non_exhaustive()
    }
}

/// Pseudo-headers first, then the request's own fields, lowercased, minus
/// connection-specific ones (RFC 7540 §8.1.2.2).
fn request_fields(request: &Request, authority: &str) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(request.headers.len() + 4);
    fields.push((":method".to_string(), request.method.as_str().to_string()));
    fields.push((":scheme".to_string(), request.url.scheme().to_string()));
    let authority = request.headers.get("host").unwrap_or(authority);
    fields.push((":authority".to_string(), authority.to_string()));
    fields.push((":path".to_string(), request.request_target()));

    for (name, value) in request.headers.iter() {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "host" | "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
            | "upgrade" | "expect" => continue,
            "te" if !value.trim().eq_ignore_ascii_case("trailers") => continue,
            _ => fields.push((lower, value.to_string())),
        }
    }

    if !request.headers.contains("content-length") {
        if let Some(len) = request.body.known_len() {
            let needs_length =
                len > 0 || matches!(request.method, Method::Post | Method::Put | Method::Patch);
            if needs_length {
                fields.push(("content-length".to_string(), len.to_string()));
            }
        }
    }
    fields
}

fn parse_status(headers: &HeaderMap) -> Result<u16, Error> {
    headers
        .get(":status")
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| Error::protocol("response without valid :status"))
}

// ---------------------------------------------------------------------------
// Writer loop
// ---------------------------------------------------------------------------

struct WriterLoop {
    write: WriteHalf<HttpStream>,
    cmd_rx: mpsc::Receiver<Cmd>,
    frames: FrameWriter,
    encoder: HpackEncoder,
    shared: Arc<Shared>,
}

enum WriterWake {
    Cmd(Option<Cmd>),
    Shutdown,
}

impl WriterLoop {
    async fn run(mut self) {
        loop {
            if !self.frames.is_empty() {
                let out = self.frames.take();
                if let Err(e) = self.write.write_all(&out).await {
                    self.shared.fatal(&format!("socket write: {e}"));
                    return;
                }
                if let Err(e) = self.write.flush().await {
                    self.shared.fatal(&format!("socket flush: {e}"));
                    return;
                }
            }

            let shared = self.shared.clone();
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => WriterWake::Cmd(cmd),
                _ = shared.shutdown_writer.notified() => WriterWake::Shutdown,
            };
            match wake {
                WriterWake::Cmd(Some(cmd)) => {
                    self.apply(cmd);
                    // Batch whatever else is already queued.
                    while let Ok(cmd) = self.cmd_rx.try_recv() {
                        self.apply(cmd);
                    }
                }
                WriterWake::Cmd(None) => return,
                WriterWake::Shutdown => {
                    let _ = self.write.shutdown().await;
                    return;
                }
            }
        }
    }

    fn apply(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Open { id, fields, end_stream } => {
                let mut block = BytesMut::new();
                self.encoder
                    .encode(fields.iter().map(|(n, v)| (n.as_str(), v.as_str())), &mut block);
                self.frames.header_block(id, &block, end_stream);
            }
            Cmd::Data { id, data, end_stream } => {
                // Credit was reserved by the sender; only frame-size
                // splitting happens here.
                let max = self.frames.max_frame_size();
                let mut data = data;
                while data.len() > max {
                    let chunk = data.split_to(max);
                    self.frames.data(id, &chunk, false);
                }
                self.frames.data(id, &data, end_stream);
            }
            Cmd::Rst { id, code } => self.frames.rst_stream(id, code),
            Cmd::WindowUpdateOut { id, increment } => self.frames.window_update(id, increment),
            Cmd::ApplyPeerSettings(settings) => {
                for &(setting, value) in &settings {
                    match setting {
                        SETTINGS_HEADER_TABLE_SIZE => {
                            self.encoder.set_max_table_size(value as usize);
                        }
                        SETTINGS_MAX_FRAME_SIZE => {
                            self.frames.set_max_frame_size(value as usize);
                        }
                        _ => {}
                    }
                }
                self.frames.settings_ack();
            }
            Cmd::Ping { opaque } => self.frames.ping(opaque, false),
            Cmd::Pong { opaque } => self.frames.ping(opaque, true),
            Cmd::Goaway { code } => self.frames.goaway(0, code, b""),
        }
    }
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

struct ReaderLoop {
    read: ReadHalf<HttpStream>,
    buf: PooledBuf,
    parser: FrameParser,
    state: ReaderState,
    keepalive: Duration,
}

enum ReaderWake {
    Read(std::io::Result<usize>),
    Timer,
    Shutdown,
}

impl ReaderLoop {
    async fn run(mut self) {
        let mut last_frame = Instant::now();
        let mut ping_deadline: Option<Instant> = None;

        loop {
            // Parse everything buffered, then forward writer commands.
            if let Err(e) = self.parser.receive(self.buf.inner(), &mut self.state) {
                self.state.shared.fatal(&e.to_string());
                return;
            }
            let cmds = std::mem::take(&mut self.state.pending);
            for cmd in cmds {
                if self.state.shared.cmd_tx.send(cmd).await.is_err() {
                    return;
                }
            }
            if self.state.got_pong {
                self.state.got_pong = false;
                ping_deadline = None;
            }

            let shared = self.state.shared.clone();
            if shared.state.lock().unwrap().broken.is_some() {
                return;
            }
            let wake_at = ping_deadline.unwrap_or(last_frame + self.keepalive);
            let wake = tokio::select! {
                n = self.read.read_buf(self.buf.inner()) => ReaderWake::Read(n),
                _ = tokio::time::sleep_until(wake_at.into()) => ReaderWake::Timer,
                _ = shared.shutdown_reader.notified() => ReaderWake::Shutdown,
            };
            match wake {
                ReaderWake::Read(Ok(0)) => {
                    shared.fatal("peer closed connection");
                    return;
                }
                ReaderWake::Read(Ok(_)) => {
                    last_frame = Instant::now();
                }
                ReaderWake::Read(Err(e)) => {
                    shared.fatal(&format!("socket read: {e}"));
                    return;
                }
                ReaderWake::Timer => {
                    if ping_deadline.is_some() {
                        // No PONG within the timeout: the peer is gone.
                        shared.fatal("keepalive ping timed out");
                        return;
                    }
                    log::debug!("h2 connection stale for {:?}, sending PING", self.keepalive);
                    if shared.cmd_tx.send(Cmd::Ping { opaque: 0x636f7272 }).await.is_err() {
                        return;
                    }
                    ping_deadline = Some(Instant::now() + PING_TIMEOUT);
                }
                ReaderWake::Shutdown => return,
            }
        }
    }
}

/// Header block under reassembly (HEADERS..CONTINUATION until END_HEADERS).
struct HeaderAccum {
    stream_id: u32,
    end_stream: bool,
    fragments: BytesMut,
}

struct ReaderState {
    shared: Arc<Shared>,
    decoder: HpackDecoder,
    accum: Option<HeaderAccum>,
    /// Commands to forward to the writer after the parse pass.
    pending: Vec<Cmd>,
    got_pong: bool,
}

impl ReaderState {
    /// Deliver an event to a stream, dropping the stream on overflow (the
    /// peer has overrun the receive window we advertised).
    fn deliver(&mut self, id: u32, event: StreamEvent) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(entry) = state.active.get(&id) else { return };
        match entry.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("h2 stream {id} event queue overflow, resetting");
                state.active.remove(&id);
                Shared::wake_one_waiter(&mut state);
                self.pending.push(Cmd::Rst { id, code: ERROR_FLOW_CONTROL_ERROR });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.active.remove(&id);
                Shared::wake_one_waiter(&mut state);
            }
        }
    }

    fn finish_remote(&mut self, id: u32) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(entry) = state.active.get_mut(&id) {
            entry.remote_done = true;
            if entry.local_done {
                state.active.remove(&id);
                Shared::wake_one_waiter(&mut state);
            }
        }
    }

    /// A complete header block arrived: decode and classify as response
    /// headers or trailers.
    fn finish_header_block(&mut self, accum: HeaderAccum) -> Result<(), Error> {
        let mut headers = HeaderMap::new();
        self.decoder.decode(&accum.fragments, &mut headers)?;
        let is_trailers = {
            let state = self.shared.state.lock().unwrap();
            state.active.get(&accum.stream_id).map(|e| e.saw_headers).unwrap_or(false)
        };
        if is_trailers {
            if !accum.end_stream {
                return Err(Error::protocol("trailers without END_STREAM"));
            }
            self.deliver(accum.stream_id, StreamEvent::Trailers { headers });
            self.finish_remote(accum.stream_id);
        } else {
            let status = headers.get(":status").and_then(|s| s.parse::<u16>().ok());
            let informational = matches!(status, Some(s) if (100..200).contains(&s));
            if !informational {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(entry) = state.active.get_mut(&accum.stream_id) {
                    entry.saw_headers = true;
                }
            }
            let end_stream = accum.end_stream;
            self.deliver(accum.stream_id, StreamEvent::Headers { headers, end_stream });
            if end_stream {
                self.finish_remote(accum.stream_id);
            }
        }
        Ok(())
    }
}

impl FrameHandler for ReaderState {
    fn on_data(&mut self, stream_id: u32, end_stream: bool, data: Bytes) -> Result<(), Error> {
        if self.accum.is_some() {
            return Err(Error::protocol("DATA inside a header block"));
        }
        // Replenish the connection-level receive window immediately; the
        // per-stream window is replenished as the consumer reads.
        if !data.is_empty() {
            self.pending.push(Cmd::WindowUpdateOut { id: 0, increment: data.len() as u32 });
        }
        self.deliver(stream_id, StreamEvent::Data { data, end_stream });
        if end_stream {
            self.finish_remote(stream_id);
        }
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        fragment: Bytes,
    ) -> Result<(), Error> {
        if self.accum.is_some() {
            return Err(Error::protocol("HEADERS inside another header block"));
        }
        let accum = HeaderAccum { stream_id, end_stream, fragments: BytesMut::from(&fragment[..]) };
        if end_headers {
            self.finish_header_block(accum)
        } else {
            self.accum = Some(accum);
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        stream_id: u32,
        end_headers: bool,
        fragment: Bytes,
    ) -> Result<(), Error> {
        let Some(mut accum) = self.accum.take() else {
            return Err(Error::protocol("CONTINUATION without open header block"));
        };
        if accum.stream_id != stream_id {
            return Err(Error::protocol("CONTINUATION for a different stream"));
        }
        accum.fragments.extend_from_slice(&fragment);
        if end_headers {
            self.finish_header_block(accum)
        } else {
            self.accum = Some(accum);
            Ok(())
        }
    }

    fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) -> Result<(), Error> {
        log::debug!("stream {stream_id} reset by peer: {}", error_code_name(error_code));
        self.deliver(stream_id, StreamEvent::Reset { code: error_code });
        self.shared.remove_stream(stream_id);
        Ok(())
    }

    fn on_settings(&mut self, ack: bool, settings: Vec<(u16, u32)>) -> Result<(), Error> {
        if ack {
            return Ok(());
        }
        let mut windows_changed = false;
        {
            let mut state = self.shared.state.lock().unwrap();
            for &(setting, value) in &settings {
                match setting {
                    SETTINGS_MAX_CONCURRENT_STREAMS => {
                        let grew = value > state.max_concurrent;
                        state.max_concurrent = value;
                        if grew {
                            Shared::wake_one_waiter(&mut state);
                        }
                    }
                    SETTINGS_INITIAL_WINDOW_SIZE => {
                        if value > MAX_WINDOW {
                            return Err(Error::protocol("initial window above 2^31-1"));
                        }
                        let delta = value as i64 - state.initial_send_window;
                        state.initial_send_window = value as i64;
                        for entry in state.active.values_mut() {
                            entry.send_window += delta;
                        }
                        windows_changed = true;
                    }
                    _ => {}
                }
            }
        }
        if windows_changed {
            self.shared.window_notify.notify_waiters();
        }
        // The writer applies encoder/frame-size settings and sends the ACK.
        self.pending.push(Cmd::ApplyPeerSettings(settings));
        Ok(())
    }

    fn on_push_promise(&mut self, _stream_id: u32, promised_id: u32) -> Result<(), Error> {
        // We advertise ENABLE_PUSH=0; a push is a protocol violation.
        Err(Error::protocol(format!("unexpected PUSH_PROMISE of stream {promised_id}")))
    }

    fn on_ping(&mut self, ack: bool, opaque: u64) -> Result<(), Error> {
        if ack {
            self.got_pong = true;
        } else {
            self.pending.push(Cmd::Pong { opaque });
        }
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, error_code: u32, debug: Bytes) -> Result<(), Error> {
        log::debug!(
            "GOAWAY last_stream={last_stream_id} code={} debug={:?}",
            error_code_name(error_code),
            String::from_utf8_lossy(&debug)
        );
        let mut state = self.shared.state.lock().unwrap();
        state.goaway_last_id = Some(last_stream_id);
        state.closing = true;
        // Streams the server promises it never processed are safe to retry;
        // lower ids run to completion.
        let unprocessed: Vec<u32> =
            state.active.keys().copied().filter(|&id| id > last_stream_id).collect();
        for id in unprocessed {
            if let Some(entry) = state.active.remove(&id) {
                let _ = entry.events_tx.try_send(StreamEvent::NotProcessed);
            }
        }
        state.admission_waiters.clear();
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Error> {
        let mut state = self.shared.state.lock().unwrap();
        if stream_id == 0 {
            state.conn_send_window += increment as i64;
            if state.conn_send_window > MAX_WINDOW as i64 {
                return Err(Error::protocol("connection send window overflow"));
            }
        } else if let Some(entry) = state.active.get_mut(&stream_id) {
            entry.send_window += increment as i64;
            if entry.send_window > MAX_WINDOW as i64 {
                return Err(Error::protocol("stream send window overflow"));
            }
        }
        drop(state);
        self.shared.window_notify.notify_waiters();
        Ok(())
    }
}
