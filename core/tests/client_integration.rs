/*
 * client_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * End-to-end tests for the client core against loopback servers: HTTP/1.1
 * keep-alive and pooling, retry and circuit-breaker behavior, cancellation,
 * and HTTP/2 multiplexing over prior knowledge (the h2 test server is built
 * from the crate's own frame codec).
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use corriere_core::breaker::{BreakerConfig, BreakerScope};
use corriere_core::error::ErrorKind;
use corriere_core::h2::frame::SETTINGS_MAX_CONCURRENT_STREAMS;
use corriere_core::h2::{FrameHandler, FrameParser, FrameWriter};
use corriere_core::hpack::{HpackDecoder, HpackEncoder};
use corriere_core::{
    Client, ClientConfig, ErrorCategory, HeaderMap, Method, Protocol, Request, RequestOptions,
    RetryPolicy,
};

// ---------------------------------------------------------------------------
// HTTP/1.1 test server
// ---------------------------------------------------------------------------

/// Serve scripted responses: one accepted connection handles any number of
/// requests, popping one script entry per request. An empty script entry
/// closes the connection after reading the request head.
async fn h1_server(responses: Vec<Vec<&'static str>>) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        for script in responses {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            for part in script {
                if read_request_head(&mut sock).await.is_none() {
                    break;
                }
                if part.is_empty() {
                    // Scripted mid-exchange close.
                    break;
                }
                sock.write_all(part.as_bytes()).await.unwrap();
            }
        }
    });
    (format!("http://{addr}"), handle)
}

/// Read one request head (through the blank line). Returns None on EOF.
async fn read_request_head(sock: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match sock.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
        if head.ends_with(b"\r\n\r\n") {
            return Some(head);
        }
    }
}

fn no_retry_config() -> ClientConfig {
    ClientConfig {
        enable_http2: false,
        retry: RetryPolicy::none(),
        ..ClientConfig::default()
    }
}

fn get(url: &str) -> Request {
    Request::builder(Method::Get, url).build().unwrap()
}

// ---------------------------------------------------------------------------
// HTTP/1.1 end-to-end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_get_returns_body_and_pools_connection() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
    ]])
    .await;
    let client = Client::new(no_retry_config());

    let mut response = client.send(get(&format!("{url}/ok")), RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.protocol(), Protocol::H1);
    assert_eq!(response.read_text().await.unwrap(), "hi");

    // Body fully consumed: the connection must be back in the pool.
    assert_eq!(client.pool().idle_connections(), 1);
    assert_eq!(client.pool().connections_created(), 1);
}

#[tokio::test]
async fn sequential_gets_reuse_the_idle_connection() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na",
        "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb",
    ]])
    .await;
    let client = Client::new(no_retry_config());

    let mut first = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(first.read_text().await.unwrap(), "a");
    let mut second = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(second.read_text().await.unwrap(), "b");

    assert_eq!(client.pool().connections_created(), 1, "same connection must be reused");
    assert!(client.pool().connections_reused() >= 1);
}

#[tokio::test]
async fn connection_close_header_is_not_pooled() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx",
    ]])
    .await;
    let client = Client::new(no_retry_config());
    let mut response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.read_text().await.unwrap(), "x");
    assert_eq!(client.pool().idle_connections(), 0);
}

#[tokio::test]
async fn chunked_body_with_trailers() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
         4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Checksum: abc\r\n\r\n",
    ]])
    .await;
    let client = Client::new(no_retry_config());
    let mut response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.read_text().await.unwrap(), "Wikipedia");
    let trailers = response.body_mut().trailers().expect("trailers after full read");
    assert_eq!(trailers.get("x-checksum"), Some("abc"));
}

#[tokio::test]
async fn zero_length_and_204_bodies() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 204 No Content\r\n\r\n",
    ]])
    .await;
    let client = Client::new(no_retry_config());

    let mut a = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(a.status(), 200);
    assert_eq!(a.read_all().await.unwrap().len(), 0);

    let mut b = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(b.status(), 204);
    assert_eq!(b.read_all().await.unwrap().len(), 0);
    // Both were bodyless: the connection was reusable each time.
    assert_eq!(client.pool().connections_created(), 1);
}

#[tokio::test]
async fn expect_100_continue_flow() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_request_head(&mut sock).await.unwrap();
        sock.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();
        let mut body = [0u8; 5];
        sock.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let client = Client::new(no_retry_config());
    let request = Request::builder(Method::Post, &format!("http://{addr}/upload"))
        .header("Expect", "100-continue")
        .body_bytes("hello")
        .build()
        .unwrap();
    let mut response = client.send(request, RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.read_text().await.unwrap(), "ok");
}

#[tokio::test]
async fn informational_responses_are_discarded() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 103 Early Hints\r\nLink: </style.css>\r\n\r\n\
         HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    ]])
    .await;
    let client = Client::new(no_retry_config());
    let mut response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.read_text().await.unwrap(), "ok");
}

// ---------------------------------------------------------------------------
// Retry engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_loss_is_retried_for_idempotent_requests() {
    // First accepted connection closes after the request head; the second
    // serves the response.
    let (url, _server) = h1_server(vec![
        vec![""],
        vec!["HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"],
    ])
    .await;

    let mut config = no_retry_config();
    config.retry = RetryPolicy {
        max_retries: 2,
        retry_categories: vec![ErrorCategory::Connection],
        ..RetryPolicy::default()
    };
    let client = Client::new(config);

    let mut response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.read_text().await.unwrap(), "ok");
    assert_eq!(client.pool().connections_created(), 2);
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let (url, _server) = h1_server(vec![vec![""], vec![""], vec![""], vec![""]]).await;
    let mut config = no_retry_config();
    config.retry = RetryPolicy {
        max_retries: 2,
        retry_categories: vec![ErrorCategory::Connection],
        ..RetryPolicy::default()
    };
    let client = Client::new(config);

    let err = client.send(get(&url), RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Connection { .. }));
    // max_retries + 1 transport attempts, no more.
    assert_eq!(client.pool().connections_created(), 3);
}

#[tokio::test]
async fn non_idempotent_post_is_not_retried_mid_stream() {
    let (url, _server) = h1_server(vec![vec![""], vec![""]]).await;
    let mut config = no_retry_config();
    config.retry = RetryPolicy {
        max_retries: 2,
        retry_categories: vec![ErrorCategory::Connection],
        ..RetryPolicy::default()
    };
    let client = Client::new(config);

    let request = Request::builder(Method::Post, &url).body_bytes("payload").build().unwrap();
    let err = client.send(request, RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Connection { .. }));
    assert_eq!(client.pool().connections_created(), 1, "POST must not be replayed");
}

#[tokio::test]
async fn status_force_list_retries_and_honors_retry_after() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nRetry-After: 1\r\n\r\n",
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    ]])
    .await;

    let mut config = no_retry_config();
    config.retry = RetryPolicy {
        max_retries: 1,
        retry_categories: vec![ErrorCategory::RateLimit],
        status_force_list: vec![429],
        respect_retry_after: true,
        ..RetryPolicy::default()
    };
    let client = Client::new(config);

    let started = Instant::now();
    let mut response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.read_text().await.unwrap(), "ok");
    // Retry-After: 1 must dominate the (sub-second) backoff proposal.
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn timeout_surfaces_as_timeout_category() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_request_head(&mut sock).await;
        // Never respond.
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut config = no_retry_config();
    config.request_timeout = Some(Duration::from_millis(200));
    let client = Client::new(config);

    let err = client.send(get(&format!("http://{addr}/")), RequestOptions::default()).await.unwrap_err();
    assert!(
        err.categories().contains(&ErrorCategory::Timeout) || err.is_cancelled(),
        "unexpected error: {err}"
    );
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breaker_opens_after_consecutive_server_errors() {
    let (url, _server) = h1_server(vec![vec![
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    ]])
    .await;

    let mut config = no_retry_config();
    config.breaker = Some(BreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(300),
        success_threshold: 1,
        window: Duration::from_secs(60),
        scope: BreakerScope::PerHost,
        max_hosts: 16,
    });
    let client = Client::new(config);

    for _ in 0..3 {
        let mut r = client.send(get(&url), RequestOptions::default()).await.unwrap();
        assert_eq!(r.status(), 503);
        let _ = r.read_all().await;
    }

    // Circuit is open: rejection is immediate and performs no I/O.
    let started = Instant::now();
    let err = client.send(get(&url), RequestOptions::default()).await.unwrap_err();
    assert!(err.is_circuit_open(), "expected CircuitOpen, got {err}");
    assert!(started.elapsed() < Duration::from_millis(50));

    // After the recovery timeout a probe goes through and closes it.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let mut r = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(r.status(), 200);
    assert_eq!(r.read_text().await.unwrap(), "ok");
}

// ---------------------------------------------------------------------------
// Pool limits and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_exhaustion_times_out_with_pool_exhausted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Accept one connection and sit on it.
        let (mut sock, _) = listener.accept().await.unwrap();
        read_request_head(&mut sock).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut config = no_retry_config();
    config.max_keepalive_connections = 1;
    let client = Arc::new(Client::new(config));
    let url = format!("http://{addr}/");

    let blocker = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            let request = Request::builder(Method::Get, &url)
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap();
            let _ = client.send(request, RequestOptions::default()).await;
        })
    };
    // Give the blocker time to claim the single per-host slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let request = Request::builder(Method::Get, &url)
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let err = client.send(request, RequestOptions::default()).await.unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::PoolExhausted { .. }) || err.is_cancelled(),
        "unexpected error: {err}"
    );
    blocker.abort();
}

#[tokio::test]
async fn dropping_an_unread_body_discards_the_connection() {
    let (url, _server) = h1_server(vec![
        vec!["HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n"],
        vec!["HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"],
    ])
    .await;
    let client = Client::new(no_retry_config());

    let response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    // Drop with 1000 body bytes unread: mid-read connections are Broken.
    drop(response);
    assert_eq!(client.pool().idle_connections(), 0);

    let mut next = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(next.read_text().await.unwrap(), "ok");
    assert_eq!(client.pool().connections_created(), 2);
}

// ---------------------------------------------------------------------------
// HTTP/2 (prior knowledge over loopback TCP)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct H2ServerStats {
    open: AtomicU32,
    watermark: AtomicU32,
    connections: AtomicU32,
}

impl H2ServerStats {
    fn stream_opened(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.watermark.fetch_max(now, Ordering::SeqCst);
    }

    fn stream_answered(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Frame handler for the test server: records opened streams, queues
/// settings acks and pings. The decoder persists for the connection's
/// lifetime because the client encoder builds up its dynamic table.
struct H2ServerState {
    decoder: HpackDecoder,
    opened: Vec<u32>,
    needs_ack: bool,
    pings: Vec<u64>,
}

impl H2ServerState {
    fn new() -> Self {
        Self { decoder: HpackDecoder::new(4096), opened: Vec::new(), needs_ack: false, pings: Vec::new() }
    }
}

impl FrameHandler for H2ServerState {
    fn on_data(&mut self, _id: u32, _end: bool, _data: bytes::Bytes) -> Result<(), corriere_core::Error> {
        Ok(())
    }
    fn on_headers(
        &mut self,
        id: u32,
        _end_stream: bool,
        end_headers: bool,
        fragment: bytes::Bytes,
    ) -> Result<(), corriere_core::Error> {
        assert!(end_headers, "test server does not handle CONTINUATION");
        let mut headers = HeaderMap::new();
        self.decoder.decode(&fragment, &mut headers)?;
        assert_eq!(headers.get(":method"), Some("GET"));
        self.opened.push(id);
        Ok(())
    }
    fn on_continuation(&mut self, _id: u32, _eh: bool, _f: bytes::Bytes) -> Result<(), corriere_core::Error> {
        Ok(())
    }
    fn on_rst_stream(&mut self, _id: u32, _code: u32) -> Result<(), corriere_core::Error> {
        Ok(())
    }
    fn on_settings(&mut self, ack: bool, _settings: Vec<(u16, u32)>) -> Result<(), corriere_core::Error> {
        if !ack {
            self.needs_ack = true;
        }
        Ok(())
    }
    fn on_push_promise(&mut self, _id: u32, _p: u32) -> Result<(), corriere_core::Error> {
        Ok(())
    }
    fn on_ping(&mut self, ack: bool, opaque: u64) -> Result<(), corriere_core::Error> {
        if !ack {
            self.pings.push(opaque);
        }
        Ok(())
    }
    fn on_goaway(&mut self, _l: u32, _c: u32, _d: bytes::Bytes) -> Result<(), corriere_core::Error> {
        Ok(())
    }
    fn on_window_update(&mut self, _id: u32, _inc: u32) -> Result<(), corriere_core::Error> {
        Ok(())
    }
}

/// Minimal h2 server: advertises a stream cap, answers every GET with
/// `200 hi` after a short delay (so concurrency is observable), and can
/// send GOAWAY after the first response.
async fn h2_server(
    max_concurrent: u32,
    goaway_after_first: bool,
    stats: Arc<H2ServerStats>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else { return };
            stats.connections.fetch_add(1, Ordering::SeqCst);
            let stats = stats.clone();
            tokio::spawn(h2_serve_conn(sock, max_concurrent, goaway_after_first, stats));
        }
    });
    format!("http://{addr}")
}

async fn h2_serve_conn(
    mut sock: TcpStream,
    max_concurrent: u32,
    goaway_after_first: bool,
    stats: Arc<H2ServerStats>,
) {
    let mut preface = [0u8; 24];
    if sock.read_exact(&mut preface).await.is_err() {
        return;
    }
    assert_eq!(&preface, b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");

    let (mut read, write) = sock.into_split();
    let write = Arc::new(tokio::sync::Mutex::new(write));
    {
        let mut frames = FrameWriter::new();
        frames.settings(&[(SETTINGS_MAX_CONCURRENT_STREAMS, max_concurrent)]);
        write.lock().await.write_all(&frames.take()).await.unwrap();
    }

    let encoder = Arc::new(tokio::sync::Mutex::new(HpackEncoder::new(4096)));
    let mut parser = FrameParser::new();
    let mut state = H2ServerState::new();
    let mut buf = BytesMut::new();
    let mut answered_first = false;

    loop {
        match read.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if parser.receive(&mut buf, &mut state).is_err() {
            return;
        }
        if state.needs_ack {
            state.needs_ack = false;
            let mut frames = FrameWriter::new();
            frames.settings_ack();
            write.lock().await.write_all(&frames.take()).await.unwrap();
        }
        for opaque in state.pings.drain(..) {
            let mut frames = FrameWriter::new();
            frames.ping(opaque, true);
            write.lock().await.write_all(&frames.take()).await.unwrap();
        }
        for id in state.opened.drain(..) {
            stats.stream_opened();
            let write = write.clone();
            let encoder = encoder.clone();
            let stats = stats.clone();
            let send_goaway = goaway_after_first && !answered_first;
            answered_first = true;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut frames = FrameWriter::new();
                {
                    let mut encoder = encoder.lock().await;
                    let mut block = BytesMut::new();
                    encoder.encode(
                        [(":status", "200"), ("content-type", "text/plain")].into_iter(),
                        &mut block,
                    );
                    frames.header_block(id, &block, false);
                }
                frames.data(id, b"hi", true);
                stats.stream_answered();
                let mut w = write.lock().await;
                w.write_all(&frames.take()).await.unwrap();
                if send_goaway {
                    let mut frames = FrameWriter::new();
                    frames.goaway(id, 0, b"maintenance");
                    w.write_all(&frames.take()).await.unwrap();
                }
            });
        }
    }
}

fn h2_config() -> ClientConfig {
    ClientConfig {
        enable_http2: true,
        http2_only: true,
        retry: RetryPolicy::none(),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn h2_prior_knowledge_get() {
    let stats = Arc::new(H2ServerStats::default());
    let url = h2_server(100, false, stats.clone()).await;
    let client = Client::new(h2_config());

    let mut response = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.protocol(), Protocol::H2);
    assert_eq!(response.headers().get("content-type"), Some("text/plain"));
    assert_eq!(response.read_text().await.unwrap(), "hi");
}

#[tokio::test]
async fn h2_multiplexes_on_one_connection_within_stream_cap() {
    let stats = Arc::new(H2ServerStats::default());
    let url = h2_server(4, false, stats.clone()).await;
    let client = Arc::new(Client::new(h2_config()));

    // Warm-up request guarantees the server's SETTINGS (cap 4) are applied
    // before the burst.
    let mut warmup = client.send(get(&url), RequestOptions::default()).await.unwrap();
    warmup.read_all().await.unwrap();
    stats.watermark.store(0, Ordering::SeqCst);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            let mut response = client.send(get(&url), RequestOptions::default()).await?;
            response.read_text().await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "hi");
    }

    assert_eq!(stats.connections.load(Ordering::SeqCst), 1, "one connection multiplexes all");
    assert_eq!(client.pool().connections_created(), 1);
    assert!(
        stats.watermark.load(Ordering::SeqCst) <= 4,
        "peer stream cap exceeded: {}",
        stats.watermark.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn h2_goaway_retires_the_connection() {
    let stats = Arc::new(H2ServerStats::default());
    let url = h2_server(100, true, stats.clone()).await;
    let client = Client::new(h2_config());

    let mut first = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(first.read_text().await.unwrap(), "hi");

    // Wait for the GOAWAY to land, then issue another request: it must go
    // out on a fresh connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = client.send(get(&url), RequestOptions::default()).await.unwrap();
    assert_eq!(second.read_text().await.unwrap(), "hi");
    assert_eq!(stats.connections.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Validation and options
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_headers_fail_validation_without_io() {
    let client = Client::new(no_retry_config());
    // Port 9 would refuse; validation must reject before any connect.
    let mut request = Request::builder(Method::Get, "http://127.0.0.1:9/").build().unwrap();
    request.headers.append("x-bad", "a\r\nInjected: yes");
    let started = Instant::now();
    let err = client.send(request, RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn extra_headers_do_not_override_request_headers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let head = read_request_head(&mut sock).await.unwrap();
        seen_server.lock().unwrap().push(String::from_utf8_lossy(&head).to_string());
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
    });

    let client = Client::new(no_retry_config());
    let request = Request::builder(Method::Get, &format!("http://{addr}/"))
        .header("X-App", "request")
        .build()
        .unwrap();
    let mut extra = HeaderMap::new();
    extra.append("X-App", "options");
    extra.append("X-Extra", "1");
    let options = RequestOptions { headers_extra: Some(extra), ..RequestOptions::default() };

    let response = client.send(request, options).await.unwrap();
    assert_eq!(response.status(), 200);
    let head = seen.lock().unwrap().pop().unwrap();
    assert!(head.contains("X-App: request\r\n"));
    assert!(!head.contains("X-App: options"));
    assert!(head.contains("X-Extra: 1\r\n"));
}
