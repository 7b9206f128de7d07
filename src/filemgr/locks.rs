//! Concurrency controller
//!
//! Two lock families guard a file handle:
//!
//! - `BlockLocks`: per-block mutual exclusion sharded over a fixed prime
//!   number of buckets. Locking one block never blocks unrelated blocks.
//! - `WriterLock`: the single commit mutex. Exactly one thread may be
//!   mid-commit; ordinary block I/O proceeds outside it. `try_lock` returns
//!   a busy indication immediately so maintenance tasks never deadlock
//!   against an in-flight commit.
//!
//! The process-wide open-registry mutex lives in `registry.rs`; reference
//! counting uses its own small mutex on the handle.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::BlockId;

/// Shard count for block locks; prime to reduce systematic collisions
const NUM_SHARDS: usize = 41;

/// Sharded per-block locks
///
/// Callers see only `lock(bid)`; the sharding scheme is not observable.
pub(crate) struct BlockLocks {
    shards: Vec<Mutex<()>>,
}

impl BlockLocks {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquire the lock covering `bid`
    pub(crate) fn lock(&self, bid: BlockId) -> MutexGuard<'_, ()> {
        self.shards[(bid % NUM_SHARDS as u64) as usize].lock()
    }
}

/// Commit mutex with a cheap observable `locked` flag
pub(crate) struct WriterLock {
    inner: Mutex<()>,
    locked: AtomicBool,
}

/// Guard for the commit critical section
pub(crate) struct WriterGuard<'a> {
    lock: &'a WriterLock,
    _inner: MutexGuard<'a, ()>,
}

impl WriterLock {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(()),
            locked: AtomicBool::new(false),
        }
    }

    /// Block until the commit section is free
    pub(crate) fn lock(&self) -> WriterGuard<'_> {
        let inner = self.inner.lock();
        self.locked.store(true, Ordering::Release);
        WriterGuard { lock: self, _inner: inner }
    }

    /// Non-blocking acquire; `None` means a commit is in flight
    pub(crate) fn try_lock(&self) -> Option<WriterGuard<'_>> {
        let inner = self.inner.try_lock()?;
        self.locked.store(true, Ordering::Release);
        Some(WriterGuard { lock: self, _inner: inner })
    }

    /// Whether a commit is currently in flight
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
