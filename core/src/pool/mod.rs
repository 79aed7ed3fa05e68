/*
 * mod.rs
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

//! Connection pool: per-host sub-pools under a global cap. Acquisition
//! prefers an existing HTTP/2 connection (multiplexing beats one-shot
//! reuse), then the most recently used idle HTTP/1.1 connection, then a new
//! connection if the host and global caps allow. When the caps are reached,
//! acquirers queue FIFO; returned connections are handed directly to the
//! head of the queue. A background reaper evicts idle connections past
//! their keep-alive age in bounded batches.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::bufpool::BufferPool;
use crate::error::{Error, ErrorKind};
use crate::h1::{ConnRelease, H1Connection};
use crate::h2::H2Connection;
use crate::net::{self, ProtocolPrefs};
use crate::request::HostKey;
use crate::response::Protocol;
use crate::trace::{Counter, MetricsCollector};

/// How many evictions one reaper sweep may perform.
const REAP_BATCH: usize = 8;

/// Pool-level tunables, filled from the client config.
#[derive(Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_per_host: usize,
    pub max_keepalive: Duration,
    /// How long an acquire may queue before PoolExhausted.
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub prefs: ProtocolPrefs,
    /// Keepalive PING interval for h2 connections.
    pub h2_keepalive: Option<Duration>,
    /// Counter sink for connection creation/reuse.
    pub metrics: Option<Arc<dyn MetricsCollector>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_host: 20,
            max_keepalive: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            read_timeout: None,
            prefs: ProtocolPrefs { enable_http2: true, http2_only: false },
            h2_keepalive: None,
            metrics: None,
        }
    }
}

/// A checked-out connection.
pub enum Acquired {
    /// Exclusive HTTP/1.1 connection plus the slot that returns it.
    H1(H1Connection, H1Slot),
    /// Shared handle onto a multiplexed HTTP/2 connection.
    H2(H2Connection),
}

/// What a queued acquirer receives.
enum Gift {
    /// A reusable connection, slot accounting unchanged.
    Conn(H1Connection),
    /// A slot was freed; retry the acquire fast path.
    Permission,
}

struct IdleConn {
    conn: H1Connection,
    since: Instant,
}

struct HostState {
    idle: Vec<IdleConn>,
    h2: Vec<H2Connection>,
    /// Connections attributed to this host: in-use h1 + idle h1 + h2.
    total: usize,
    waiters: VecDeque<oneshot::Sender<Gift>>,
}

struct HostShared {
    key: HostKey,
    state: Mutex<HostState>,
}

struct GlobalState {
    total: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct PoolShared {
    config: PoolConfig,
    connector: TlsConnector,
    bufpool: BufferPool,
    hosts: Mutex<HashMap<HostKey, Arc<HostShared>>>,
    global: Mutex<GlobalState>,
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicBool,
    reaper_shutdown: Notify,
}

/// The pool. Cloneable handle; one instance per client.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: TlsConnector, bufpool: BufferPool) -> Self {
        let shared = Arc::new(PoolShared {
            config,
            connector,
            bufpool,
            hosts: Mutex::new(HashMap::new()),
            global: Mutex::new(GlobalState { total: 0, waiters: VecDeque::new() }),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            reaper_shutdown: Notify::new(),
        });
        tokio::spawn(reaper(shared.clone()));
        Self { shared }
    }

    /// Checked-out connection for `key`, preferring h2 multiplexing when
    /// asked. Queues FIFO under per-host and global caps; gives up with
    /// PoolExhausted once the acquire timeout (bounded by `deadline`)
    /// passes.
    pub async fn acquire(
        &self,
        key: &HostKey,
        prefer_h2: bool,
        deadline: Option<Instant>,
    ) -> Result<Acquired, Error> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(Error::closed("connection pool is closed"));
        }
        let host = self.host_entry(key);
        let started = Instant::now();
        let give_up = {
            let mut give_up = started + self.shared.config.acquire_timeout;
            if let Some(d) = deadline {
                give_up = give_up.min(d);
            }
            give_up
        };

        loop {
            // Fast path under the host lock.
            let waiter = {
                let mut state = host.state.lock().unwrap();

                let before = state.h2.len();
                state.h2.retain(|c| c.is_usable());
                let removed = before - state.h2.len();
                if removed > 0 {
                    state.total -= removed;
                    drop(state);
                    for _ in 0..removed {
                        self.free_global_slot();
                    }
                    state = host.state.lock().unwrap();
                }

                // Multiplexing beats one-shot reuse, but only while the
                // connection has stream capacity left; a saturated h2
                // connection must not shadow an immediately-usable idle h1.
                if prefer_h2 {
                    if let Some(conn) = state.h2.iter().find(|c| c.has_capacity()).cloned() {
                        self.shared.reused.fetch_add(1, Ordering::Relaxed);
                        self.count(Counter::ConnectionsReused);
                        return Ok(Acquired::H2(conn));
                    }
                }

                if let Some(conn) = take_mru_idle(&mut state.idle) {
                    self.shared.reused.fetch_add(1, Ordering::Relaxed);
                    self.count(Counter::ConnectionsReused);
                    return Ok(Acquired::H1(conn, H1Slot::new(&self.shared, &host)));
                }

                if prefer_h2 && !state.h2.is_empty() {
                    // Every h2 connection is at the peer's stream cap and
                    // nothing is idle: queue on one connection's admission
                    // FIFO instead of dialing another socket to the same
                    // host.
                    let conn = state.h2[0].clone();
                    self.shared.reused.fetch_add(1, Ordering::Relaxed);
                    self.count(Counter::ConnectionsReused);
                    return Ok(Acquired::H2(conn));
                }

                if state.total < self.shared.config.max_per_host {
                    // Optimistically claim the host slot; the global slot is
                    // reserved outside the lock.
                    state.total += 1;
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            };

            match waiter {
                None => {
                    match self.reserve_global(give_up).await {
                        Ok(()) => {}
                        Err(e) => {
                            let mut state = host.state.lock().unwrap();
                            state.total -= 1;
                            Self::gift_permission(&mut state);
                            return Err(e);
                        }
                    }
                    return self.connect(key, &host).await;
                }
                Some(rx) => {
                    let now = Instant::now();
                    if now >= give_up {
                        return Err(self.exhausted(key, started));
                    }
                    match timeout(give_up - now, rx).await {
                        Ok(Ok(Gift::Conn(conn))) => {
                            self.shared.reused.fetch_add(1, Ordering::Relaxed);
                            self.count(Counter::ConnectionsReused);
                            return Ok(Acquired::H1(conn, H1Slot::new(&self.shared, &host)));
                        }
                        Ok(Ok(Gift::Permission)) => continue,
                        // Giver vanished; retry.
                        Ok(Err(_)) => continue,
                        Err(_) => return Err(self.exhausted(key, started)),
                    }
                }
            }
        }
    }

    /// Establish a new connection for a host slot already claimed.
    async fn connect(&self, key: &HostKey, host: &Arc<HostShared>) -> Result<Acquired, Error> {
        let result = net::connect(
            key,
            &self.shared.connector,
            self.shared.config.prefs,
            self.shared.config.connect_timeout,
        )
        .await;

        match result {
            Ok((stream, Protocol::H2)) => {
                let conn =
                    H2Connection::handshake(stream, &self.shared.bufpool, self.shared.config.h2_keepalive);
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                self.count(Counter::ConnectionsCreated);
                let mut state = host.state.lock().unwrap();
                state.h2.push(conn.clone());
                Ok(Acquired::H2(conn))
            }
            Ok((stream, Protocol::H1)) => {
                let conn = H1Connection::new(
                    stream,
                    &self.shared.bufpool,
                    self.shared.config.read_timeout,
                );
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                self.count(Counter::ConnectionsCreated);
                Ok(Acquired::H1(conn, H1Slot::new(&self.shared, host)))
            }
            Err(e) => {
                // Roll the claimed slots back.
                {
                    let mut state = host.state.lock().unwrap();
                    state.total -= 1;
                    Self::gift_permission(&mut state);
                }
                self.free_global_slot();
                Err(e)
            }
        }
    }

    /// Claim a global slot, evicting the LRU idle connection of the host
    /// with the largest idle set when the cap is reached.
    async fn reserve_global(&self, give_up: Instant) -> Result<(), Error> {
        loop {
            {
                let mut global = self.shared.global.lock().unwrap();
                if global.total < self.shared.config.max_connections {
                    global.total += 1;
                    return Ok(());
                }
            }
            if self.evict_largest_idle() {
                continue;
            }
            let rx = {
                let mut global = self.shared.global.lock().unwrap();
                // Cap may have freed while we scanned.
                if global.total < self.shared.config.max_connections {
                    global.total += 1;
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                global.waiters.push_back(tx);
                rx
            };
            let now = Instant::now();
            if now >= give_up {
                return Err(Error::new(ErrorKind::PoolExhausted {
                    host: "(global)".to_string(),
                    waited: Duration::ZERO,
                }));
            }
            match timeout(give_up - now, rx).await {
                Ok(_) => continue,
                Err(_) => {
                    return Err(Error::new(ErrorKind::PoolExhausted {
                        host: "(global)".to_string(),
                        waited: give_up - now,
                    }))
                }
            }
        }
    }

    /// Under global pressure, drop the least-recently-used idle connection
    /// from the host holding the most idle connections.
    fn evict_largest_idle(&self) -> bool {
        let candidates: Vec<Arc<HostShared>> =
            self.shared.hosts.lock().unwrap().values().cloned().collect();
        let mut best: Option<(usize, Arc<HostShared>)> = None;
        for host in candidates {
            let idle = host.state.lock().unwrap().idle.len();
            if idle > 0 && best.as_ref().map(|(n, _)| idle > *n).unwrap_or(true) {
                best = Some((idle, host));
            }
        }
        let Some((_, host)) = best else { return false };
        let mut state = host.state.lock().unwrap();
        let Some(oldest) = state
            .idle
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.since)
            .map(|(i, _)| i)
        else {
            return false;
        };
        let evicted = state.idle.remove(oldest);
        state.total -= 1;
        drop(state);
        drop(evicted);
        log::debug!("evicted LRU idle connection from {} under global pressure", host.key);
        self.free_global_slot();
        true
    }

    fn count(&self, counter: Counter) {
        if let Some(metrics) = &self.shared.config.metrics {
            metrics.increment(counter, 1);
        }
    }

    fn exhausted(&self, key: &HostKey, started: Instant) -> Error {
        Error::new(ErrorKind::PoolExhausted {
            host: key.to_string(),
            waited: started.elapsed(),
        })
    }

    fn host_entry(&self, key: &HostKey) -> Arc<HostShared> {
        let mut hosts = self.shared.hosts.lock().unwrap();
        hosts
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(HostShared {
                    key: key.clone(),
                    state: Mutex::new(HostState {
                        idle: Vec::new(),
                        h2: Vec::new(),
                        total: 0,
                        waiters: VecDeque::new(),
                    }),
                })
            })
            .clone()
    }

    fn gift_permission(state: &mut HostState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Gift::Permission).is_ok() {
                break;
            }
        }
    }

    /// A connection slot went away entirely: free its global slot and wake
    /// a global waiter.
    fn free_global_slot(&self) {
        let mut global = self.shared.global.lock().unwrap();
        global.total = global.total.saturating_sub(1);
        while let Some(waiter) = global.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
    }

    /// Total connections currently attributed to the pool.
    pub fn total_connections(&self) -> usize {
        self.shared.global.lock().unwrap().total
    }

    /// Idle HTTP/1.1 connections across all hosts.
    pub fn idle_connections(&self) -> usize {
        let hosts: Vec<Arc<HostShared>> =
            self.shared.hosts.lock().unwrap().values().cloned().collect();
        hosts.iter().map(|h| h.state.lock().unwrap().idle.len()).sum()
    }

    pub fn connections_created(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }

    pub fn connections_reused(&self) -> u64 {
        self.shared.reused.load(Ordering::Relaxed)
    }

    /// Drain everything: close idle connections, send GOAWAY on h2, refuse
    /// new acquires. In-flight requests finish on their own slots.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        self.shared.reaper_shutdown.notify_waiters();
        let hosts: Vec<Arc<HostShared>> = {
            let mut map = self.shared.hosts.lock().unwrap();
            map.drain().map(|(_, h)| h).collect()
        };
        for host in hosts {
            let mut state = host.state.lock().unwrap();
            let dropped = state.idle.len() + state.h2.len();
            for conn in state.h2.drain(..) {
                conn.close();
            }
            state.idle.clear();
            state.total = state.total.saturating_sub(dropped);
            state.waiters.clear();
            drop(state);
            for _ in 0..dropped {
                self.free_global_slot();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("total", &self.total_connections())
            .field("idle", &self.idle_connections())
            .finish()
    }
}

/// Most recently used idle connection; ties broken by lowest request count
/// to spread wear.
fn take_mru_idle(idle: &mut Vec<IdleConn>) -> Option<H1Connection> {
    if idle.is_empty() {
        return None;
    }
    let mut best = 0;
    for i in 1..idle.len() {
        let (a, b) = (&idle[i], &idle[best]);
        if a.since > b.since
            || (a.since == b.since && a.conn.meta.request_count < b.conn.meta.request_count)
        {
            best = i;
        }
    }
    Some(idle.remove(best).conn)
}

/// The checked-out slot for an HTTP/1.1 connection. Returned to the pool
/// via `H1Release` when the request/response cycle ends; dropping it
/// without a release discards the slot (Broken/Closing connections).
pub struct H1Slot {
    pool: ConnectionPool,
    host: Arc<HostShared>,
    settled: bool,
}

impl H1Slot {
    fn new(shared: &Arc<PoolShared>, host: &Arc<HostShared>) -> Self {
        Self {
            pool: ConnectionPool { shared: shared.clone() },
            host: host.clone(),
            settled: false,
        }
    }

    /// Check a healthy connection back in: hand it to the first queued
    /// waiter, else park it idle.
    fn checkin(mut self, conn: H1Connection) {
        self.settled = true;
        if self.pool.shared.closed.load(Ordering::Relaxed) {
            self.discard_inner();
            return;
        }
        let mut state = self.host.state.lock().unwrap();
        let mut gift = Gift::Conn(conn);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(gift) {
                Ok(()) => return,
                Err(returned) => gift = returned,
            }
        }
        let Gift::Conn(conn) = gift else { return };
        state.idle.push(IdleConn { since: conn.meta.last_used, conn });
    }

    /// The connection is gone: free both slots and wake waiters.
    fn discard(mut self) {
        self.settled = true;
        self.discard_inner();
    }

    fn discard_inner(&self) {
        {
            let mut state = self.host.state.lock().unwrap();
            state.total = state.total.saturating_sub(1);
            ConnectionPool::gift_permission(&mut state);
        }
        self.pool.free_global_slot();
    }
}

impl Drop for H1Slot {
    fn drop(&mut self) {
        if !self.settled {
            self.discard_inner();
        }
    }
}

/// Adapter handed to `H1Connection::send_request`; routes the finished
/// connection back into the pool.
pub struct H1Release {
    slot: Option<H1Slot>,
}

impl H1Release {
    pub fn new(slot: H1Slot) -> Box<Self> {
        Box::new(Self { slot: Some(slot) })
    }
}

impl ConnRelease for H1Release {
    fn release(mut self: Box<Self>, conn: Option<H1Connection>) {
        let Some(slot) = self.slot.take() else { return };
        match conn {
            Some(conn) => slot.checkin(conn),
            None => slot.discard(),
        }
    }
}

/// Background idle reaper: evicts keep-alive connections past their age in
/// bounded batches, and drops unusable h2 connections.
async fn reaper(shared: Arc<PoolShared>) {
    let interval = (shared.config.max_keepalive / 4).min(Duration::from_secs(30)).max(Duration::from_millis(50));
    loop {
        let shutdown = shared.reaper_shutdown.notified();
        tokio::select! {
            _ = shutdown => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.closed.load(Ordering::Relaxed) {
            return;
        }
        let pool = ConnectionPool { shared: shared.clone() };
        let hosts: Vec<Arc<HostShared>> = shared.hosts.lock().unwrap().values().cloned().collect();
        let mut budget = REAP_BATCH;
        for host in hosts {
            if budget == 0 {
                break;
            }
            let mut evicted = 0;
            {
                let mut state = host.state.lock().unwrap();
                let cutoff = shared.config.max_keepalive;
                let mut i = 0;
                while i < state.idle.len() && budget > 0 {
                    if state.idle[i].since.elapsed() > cutoff {
                        state.idle.remove(i);
                        state.total -= 1;
                        evicted += 1;
                        budget -= 1;
                    } else {
                        i += 1;
                    }
                }
                let before = state.h2.len();
                state.h2.retain(|c| {
                    c.is_usable()
                        && !(c.active_streams() == 0 && c.meta().idle_age() > cutoff)
                });
                let stale_h2 = before - state.h2.len();
                state.total -= stale_h2;
                evicted += stale_h2;
            }
            if evicted > 0 {
                log::debug!("reaped {evicted} idle connections from {}", host.key);
                for _ in 0..evicted {
                    pool.free_global_slot();
                }
            }
        }
    }
}
