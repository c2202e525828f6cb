// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recyclable byte-buffer pool.
//!
//! Every byte-moving path in the engine (export marshalling, the ingest
//! queue, vault framing, replay) draws its scratch space from a
//! [`BufferPool`] so the hot path stays allocation-free after warm-up.
//!
//! Buffers are handed out as [`Lease`] values. A lease returns its buffer
//! to the pool when released (or dropped); release is idempotent, and
//! releasing a buffer that did not come from a pool is a silent no-op.
//! Both misuse classes that would corrupt a raw pointer-based pool are
//! therefore inert here.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

/// Capacity for fresh buffers when the caller does not ask for more.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Buffers that grew beyond this are dropped on release instead of being
/// re-pooled, so one oversized request cannot pin memory forever.
pub const MAX_POOLED_CAPACITY: usize = 64 * 1024;

/// How many pooled entries we inspect before giving up and allocating.
/// A pool dominated by small buffers would otherwise make a large working
/// size churn through useless acquisitions ("recycling thrash").
const ACQUIRE_ATTEMPTS: usize = 3;

/// Marker carried by every slot the pool has produced. "SHIP".
const POOL_TAG: u32 = 0x5348_4950;

const STATE_LEASED: u32 = 0;
const STATE_POOLED: u32 = 1;

struct Slot {
    tag: u32,
    state: AtomicU32,
    data: Vec<u8>,
}

impl Slot {
    fn with_capacity(cap: usize) -> Box<Self> {
        Box::new(Slot {
            tag: POOL_TAG,
            state: AtomicU32::new(STATE_LEASED),
            data: Vec::with_capacity(cap),
        })
    }
}

/// Thread-safe pool of recyclable byte buffers.
///
/// The shelf is a fixed-size lock-free queue; when it overflows, released
/// buffers are simply dropped and reclaimed by the allocator.
pub struct BufferPool {
    shelf: ArrayQueue<Box<Slot>>,
    default_capacity: usize,
    max_pooled: usize,
    live_leases: AtomicU64,
}

impl BufferPool {
    /// Pool with default sizing (shelf of 1024 entries).
    pub fn new() -> Arc<Self> {
        Self::with_limits(1024, DEFAULT_CAPACITY, MAX_POOLED_CAPACITY)
    }

    /// Pool with explicit shelf size, default buffer capacity and
    /// maximum re-pooled capacity.
    pub fn with_limits(shelf: usize, default_capacity: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            shelf: ArrayQueue::new(shelf.max(1)),
            default_capacity,
            max_pooled,
            live_leases: AtomicU64::new(0),
        })
    }

    /// Acquire a buffer with capacity >= `max(size, default)`.
    ///
    /// The returned lease has length 0 and is marked leased. Up to
    /// [`ACQUIRE_ATTEMPTS`] pooled entries are inspected; entries that are
    /// too small go straight back to the shelf between tries.
    pub fn acquire(self: &Arc<Self>, size: usize) -> Lease {
        let want = size.max(self.default_capacity);

        let mut found: Option<Box<Slot>> = None;
        for _ in 0..ACQUIRE_ATTEMPTS {
            let Some(slot) = self.shelf.pop() else { break };
            if slot.data.capacity() >= want {
                found = Some(slot);
                break;
            }
            // Too small for this workload; put it back and look again.
            let _ = self.shelf.push(slot);
        }

        let mut slot = found.unwrap_or_else(|| Slot::with_capacity(want));
        slot.state.store(STATE_LEASED, Ordering::Release);
        slot.data.clear();

        self.live_leases.fetch_add(1, Ordering::Relaxed);
        Lease {
            slot: Some(slot),
            pool: Arc::clone(self),
        }
    }

    /// Number of leases currently outstanding.
    pub fn live_leases(&self) -> u64 {
        self.live_leases.load(Ordering::Relaxed)
    }

    /// Number of buffers resting on the shelf.
    pub fn pooled(&self) -> usize {
        self.shelf.len()
    }

    fn release_slot(&self, mut slot: Box<Slot>) {
        if slot.tag != POOL_TAG {
            // Not ours. Let the allocator reclaim it.
            return;
        }
        if slot
            .state
            .compare_exchange(
                STATE_LEASED,
                STATE_POOLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Already released once; the second release is a no-op.
            return;
        }
        self.live_leases.fetch_sub(1, Ordering::Relaxed);
        if slot.data.capacity() > self.max_pooled {
            return;
        }
        slot.data.clear();
        let _ = self.shelf.push(slot);
    }
}

/// Exclusive handle over a pooled buffer.
///
/// Dropping the lease releases the buffer; [`Lease::release`] does the
/// same explicitly and may be called more than once.
pub struct Lease {
    slot: Option<Box<Slot>>,
    pool: Arc<BufferPool>,
}

impl Lease {
    /// Wrap an externally allocated buffer so it can flow through paths
    /// that consume leases. Releasing an adopted lease never touches the
    /// pool shelf.
    pub fn adopt(pool: &Arc<BufferPool>, data: Vec<u8>) -> Lease {
        Lease {
            slot: Some(Box::new(Slot {
                tag: 0,
                state: AtomicU32::new(STATE_LEASED),
                data,
            })),
            pool: Arc::clone(pool),
        }
    }

    /// Bytes currently held.
    pub fn bytes(&self) -> &[u8] {
        self.slot.as_ref().map_or(&[], |s| s.data.as_slice())
    }

    /// Mutable access to the backing vector for in-place marshalling.
    ///
    /// # Panics
    ///
    /// Panics if the lease was already released; the acquire/fill/hand-off
    /// protocol never reaches that state.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        match self.slot.as_mut() {
            Some(slot) => &mut slot.data,
            None => unreachable!("vec_mut on released lease"),
        }
    }

    /// Length of the held bytes.
    pub fn len(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.data.len())
    }

    /// True when no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.data.capacity())
    }

    /// Return the buffer to its pool. Idempotent.
    pub fn release(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release_slot(slot);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("released", &self.slot.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_empty_buffer_of_requested_capacity() {
        let pool = BufferPool::new();
        let lease = pool.acquire(4096);
        assert_eq!(lease.len(), 0);
        assert!(lease.capacity() >= 4096);
    }

    #[test]
    fn released_buffer_is_reused() {
        let pool = BufferPool::new();
        let mut lease = pool.acquire(2048);
        lease.vec_mut().extend_from_slice(b"payload");
        lease.release();
        assert_eq!(pool.pooled(), 1);

        let lease2 = pool.acquire(2048);
        // Same capacity class, recycled, and truncated back to empty.
        assert_eq!(lease2.len(), 0);
        assert!(lease2.capacity() >= 2048);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn double_release_is_noop() {
        let pool = BufferPool::new();
        let mut lease = pool.acquire(64);
        lease.release();
        lease.release();
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.live_leases(), 0);
    }

    #[test]
    fn foreign_buffer_release_is_noop() {
        let pool = BufferPool::new();
        let mut foreign = Lease::adopt(&pool, vec![1, 2, 3]);
        foreign.release();
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.live_leases(), 0);
    }

    #[test]
    fn oversized_buffer_dropped_on_release() {
        let pool = BufferPool::new();
        let mut lease = pool.acquire(MAX_POOLED_CAPACITY + 1);
        lease.release();
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn small_entries_do_not_starve_large_requests() {
        let pool = BufferPool::new();
        // Seed the shelf with small buffers.
        for _ in 0..3 {
            let mut small = pool.acquire(16);
            small.release();
        }
        let big = pool.acquire(32 * 1024);
        assert!(big.capacity() >= 32 * 1024);
        // The small entries were returned to the shelf between tries.
        assert_eq!(pool.pooled(), 3);
    }

    #[test]
    fn drop_releases_like_explicit_release() {
        let pool = BufferPool::new();
        {
            let _lease = pool.acquire(128);
        }
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.live_leases(), 0);
    }
}
