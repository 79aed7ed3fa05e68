/*
 * net.rs
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

//! Transport establishment: TCP connect with deadline, rustls TLS with ALPN
//! (h2, http/1.1), and the unified plain/TLS stream both transports run on.
//! The negotiated protocol comes from ALPN on TLS connections; plaintext is
//! HTTP/1.1 unless h2 prior knowledge is forced.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::Error;
use crate::request::HostKey;
use crate::response::Protocol;

/// Build a root certificate store: platform native certs first, then
/// webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = root_store.add(cert);
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// TLS connector advertising the protocols the pool is allowed to use.
pub fn tls_connector(enable_http2: bool, http2_only: bool) -> TlsConnector {
    let mut config = TlsClientConfig::builder()
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    config.alpn_protocols = if http2_only {
        vec![b"h2".to_vec()]
    } else if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    TlsConnector::from(Arc::new(config))
}

/// Unified stream: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Protocol-selection knobs passed down from the client config.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolPrefs {
    pub enable_http2: bool,
    pub http2_only: bool,
}

/// Establish a transport to `key` within `connect_deadline`. Returns the
/// stream and the protocol it will speak: ALPN decides on TLS; plaintext is
/// HTTP/1.1, or h2 prior knowledge when `http2_only` is set.
pub async fn connect(
    key: &HostKey,
    connector: &TlsConnector,
    prefs: ProtocolPrefs,
    connect_deadline: Duration,
) -> Result<(HttpStream, Protocol), Error> {
    let addr = format!("{}:{}", key.host, key.port);
    let tcp = timeout(connect_deadline, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::connect_timeout(connect_deadline))?
        .map_err(|e| Error::connect_failed(format!("tcp connect to {addr}"), e))?;
    tcp.set_nodelay(true)
        .map_err(|e| Error::connect_failed("set_nodelay", e))?;

    if !key.scheme.is_tls() {
        let protocol = if prefs.http2_only { Protocol::H2 } else { Protocol::H1 };
        return Ok((HttpStream::Plain(tcp), protocol));
    }

    let server_name = ServerName::try_from(key.host.clone()).map_err(|_| {
        Error::validation(format!("invalid TLS server name {:?}", key.host))
    })?;
    let tls = timeout(connect_deadline, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::connect_timeout(connect_deadline))?
        .map_err(|e| Error::connect_failed(format!("TLS handshake with {}", key.host), e))?;

    let negotiated_h2 = tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| p == b"h2")
        .unwrap_or(false);

    let protocol = if negotiated_h2 {
        Protocol::H2
    } else if prefs.http2_only {
        // Hard failure rather than a silent downgrade.
        return Err(Error::protocol(format!(
            "http2_only set but {} negotiated http/1.1",
            key.host
        )));
    } else {
        Protocol::H1
    };
    log::debug!("connected to {} over {:?}", key, protocol);
    Ok((HttpStream::Tls(Box::new(tls)), protocol))
}
