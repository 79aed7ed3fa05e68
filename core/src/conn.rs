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

//! Connection identity and wear bookkeeping shared by the transports and
//! the pool. Lifecycle (Idle, InUse, Closing, Broken) is encoded by
//! ownership: a connection parked in the pool is Idle, one inside a body
//! reader is InUse, and Broken/Closing connections are simply dropped —
//! they can never re-enter the idle list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity and wear bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub id: u64,
    pub created: Instant,
    pub last_used: Instant,
    pub request_count: u64,
}

impl ConnMeta {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            created: now,
            last_used: now,
            request_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.request_count += 1;
    }

    pub fn idle_age(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }
}

impl Default for ConnMeta {
    fn default() -> Self {
        Self::new()
    }
}
