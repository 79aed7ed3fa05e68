/*
 * bufpool.rs
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

//! Tiered buffer pool for transport read buffers. Tiers are power-of-four
//! size classes (4K..1M) with per-tier free lists and a numeric cap; beyond
//! the cap, allocations are off-pool and never recycled.
//!
//! Reference counting rides on `bytes`: chunks carved off a `PooledBuf` via
//! `take_view` are zero-copy `Bytes` views sharing the storage. The storage
//! returns to its tier's free list only when `BytesMut::try_reclaim`
//! observes no outstanding views, so a buffer is never recycled while any
//! reader still holds a slice of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};

/// Size classes, smallest first.
pub const TIER_SIZES: [usize; 5] = [4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024, 1024 * 1024];

const DEFAULT_TIER_CAP: usize = 32;

/// Pool of recyclable transport buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    tier_cap: usize,
    tiers: Vec<Mutex<Tier>>,
    stats: PoolStats,
}

struct Tier {
    size: usize,
    free: Vec<BytesMut>,
    in_use: usize,
}

#[derive(Default)]
struct PoolStats {
    hits: AtomicU64,
    fresh: AtomicU64,
    off_pool: AtomicU64,
    returns: AtomicU64,
}

/// Counters snapshot, used by tests and the metrics hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub fresh: u64,
    pub off_pool: u64,
    pub returns: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_tier_cap(DEFAULT_TIER_CAP)
    }

    /// `tier_cap` bounds how many buffers of each size class the pool will
    /// keep alive (in use + free). The cap is a recycling budget, not a hard
    /// limit: acquire never fails, it just stops recycling past the cap.
    pub fn with_tier_cap(tier_cap: usize) -> Self {
        let tiers = TIER_SIZES
            .iter()
            .map(|&size| Mutex::new(Tier { size, free: Vec::new(), in_use: 0 }))
            .collect();
        Self {
            shared: Arc::new(PoolShared { tier_cap, tiers, stats: PoolStats::default() }),
        }
    }

    /// A buffer with capacity >= `min_size`, from the smallest tier that
    /// satisfies it. Never fails: past the tier cap (or above the largest
    /// tier) the buffer is allocated off-pool and simply not recycled.
    pub fn acquire(&self, min_size: usize) -> PooledBuf {
        let Some(tier_index) = TIER_SIZES.iter().position(|&s| s >= min_size) else {
            self.shared.stats.off_pool.fetch_add(1, Ordering::Relaxed);
            return PooledBuf {
                buf: Some(BytesMut::with_capacity(min_size)),
                tier: None,
                pool: Weak::new(),
            };
        };

        let mut tier = self.shared.tiers[tier_index].lock().unwrap();
        if let Some(buf) = tier.free.pop() {
            tier.in_use += 1;
            self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
            return PooledBuf {
                buf: Some(buf),
                tier: Some(tier_index),
                pool: Arc::downgrade(&self.shared),
            };
        }
        if tier.free.len() + tier.in_use < self.shared.tier_cap {
            tier.in_use += 1;
            let size = tier.size;
            drop(tier);
            self.shared.stats.fresh.fetch_add(1, Ordering::Relaxed);
            return PooledBuf {
                buf: Some(BytesMut::with_capacity(size)),
                tier: Some(tier_index),
                pool: Arc::downgrade(&self.shared),
            };
        }
        drop(tier);
        self.shared.stats.off_pool.fetch_add(1, Ordering::Relaxed);
        PooledBuf { buf: Some(BytesMut::with_capacity(min_size)), tier: None, pool: Weak::new() }
    }

    /// Free-list length for the tier holding `size`-byte buffers (tests).
    pub fn free_count(&self, size: usize) -> usize {
        match TIER_SIZES.iter().position(|&s| s >= size) {
            Some(i) => self.shared.tiers[i].lock().unwrap().free.len(),
            None => 0,
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let s = &self.shared.stats;
        BufferPoolStats {
            hits: s.hits.load(Ordering::Relaxed),
            fresh: s.fresh.load(Ordering::Relaxed),
            off_pool: s.off_pool.load(Ordering::Relaxed),
            returns: s.returns.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer leased from the pool. The holder is the sole writer; readers get
/// zero-copy `Bytes` views via `take_view`/`take_all`. Dropping the lease
/// returns the storage to its tier once all views are gone.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    tier: Option<usize>,
    pool: Weak<PoolShared>,
}

impl PooledBuf {
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.capacity())
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying accumulation buffer, for socket reads and parsing.
    pub fn inner(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Detach the first `len` filled bytes as a shared view. Zero-copy: the
    /// view holds a reference on the storage until dropped.
    pub fn take_view(&mut self, len: usize) -> Bytes {
        self.inner().split_to(len).freeze()
    }

    /// Detach everything filled so far as one shared view.
    pub fn take_all(&mut self) -> Bytes {
        let b = self.inner();
        let len = b.len();
        b.split_to(len).freeze()
    }

    pub fn extend_from_slice(&mut self, src: &[u8]) {
        self.inner().extend_from_slice(src);
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else { return };
        let Some(tier_index) = self.tier else { return };
        let Some(pool) = self.pool.upgrade() else { return };
        let mut tier = pool.tiers[tier_index].lock().unwrap();
        tier.in_use = tier.in_use.saturating_sub(1);
        buf.clear();
        // try_reclaim only succeeds when no Bytes views are outstanding.
        let size = tier.size;
        if buf.try_reclaim(size) && tier.free.len() < pool.tier_cap {
            tier.free.push(buf);
            pool.stats.returns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_picks_smallest_satisfying_tier() {
        let pool = BufferPool::new();
        assert_eq!(pool.acquire(1).capacity(), 4 * 1024);
        assert_eq!(pool.acquire(4096).capacity(), 4 * 1024);
        assert_eq!(pool.acquire(4097).capacity(), 16 * 1024);
        assert_eq!(pool.acquire(1024 * 1024).capacity(), 1024 * 1024);
    }

    #[test]
    fn oversized_acquire_is_off_pool() {
        let pool = BufferPool::new();
        let buf = pool.acquire(2 * 1024 * 1024);
        assert!(buf.capacity() >= 2 * 1024 * 1024);
        drop(buf);
        assert_eq!(pool.free_count(2 * 1024 * 1024), 0);
        assert_eq!(pool.stats().off_pool, 1);
        assert_eq!(pool.stats().returns, 0);
    }

    #[test]
    fn release_then_acquire_reuses_storage() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(1000);
        buf.extend_from_slice(b"hello");
        drop(buf);
        assert_eq!(pool.free_count(1000), 1);
        assert_eq!(pool.stats().returns, 1);

        let buf = pool.acquire(1000);
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(buf.len(), 0, "recycled buffer must come back empty");
    }

    #[test]
    fn outstanding_view_blocks_recycling() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(100);
        buf.extend_from_slice(b"payload");
        let view = buf.take_view(7);
        drop(buf);
        // View still alive: storage must not be back on the free list.
        assert_eq!(pool.free_count(100), 0);
        assert_eq!(&view[..], b"payload");
    }

    #[test]
    fn views_are_zero_copy_and_ordered() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(100);
        buf.extend_from_slice(b"abcdef");
        let a = buf.take_view(3);
        let b = buf.take_all();
        assert_eq!(&a[..], b"abc");
        assert_eq!(&b[..], b"def");
    }

    #[test]
    fn tier_cap_spills_off_pool() {
        let pool = BufferPool::with_tier_cap(2);
        let b1 = pool.acquire(100);
        let b2 = pool.acquire(100);
        let b3 = pool.acquire(100);
        assert_eq!(pool.stats().fresh, 2);
        assert_eq!(pool.stats().off_pool, 1);
        drop(b3);
        drop(b2);
        drop(b1);
        assert_eq!(pool.free_count(100), 2);
    }
}
