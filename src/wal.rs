//! Write-ahead log boundary
//!
//! The in-memory WAL index lives above basalt; this module is only the seam
//! between the two. A `WalLink` travels with its file handle for the
//! handle's whole lifetime and carries two things across the boundary:
//!
//! - dirty-root block ids decoded from a commit header on open or rollback,
//!   which the index layer consumes to rebuild its state without replay
//! - commit notifications, so the index layer can advance its flushed mark

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{BlockId, BLOCK_NOT_FOUND};

/// Per-file link to the in-memory write-ahead log index
pub struct WalLink {
    num_shards: u16,
    restored_roots: Mutex<Option<(BlockId, BlockId)>>,
    flushed_revnum: AtomicU64,
    flushed_seqnum: AtomicU64,
}

impl WalLink {
    pub fn new(num_shards: u16) -> Self {
        Self {
            num_shards,
            restored_roots: Mutex::new(None),
            flushed_revnum: AtomicU64::new(0),
            flushed_seqnum: AtomicU64::new(0),
        }
    }

    /// Shard count the index layer was asked to use
    pub fn num_shards(&self) -> u16 {
        self.num_shards
    }

    /// Record dirty roots decoded from a header (open or rollback path)
    pub fn adopt_roots(&self, idtree_root: BlockId, seqtree_root: BlockId) {
        if idtree_root != BLOCK_NOT_FOUND || seqtree_root != BLOCK_NOT_FOUND {
            *self.restored_roots.lock() = Some((idtree_root, seqtree_root));
        }
    }

    /// Hand restored roots to the index layer; `None` means replay is needed
    pub fn take_roots(&self) -> Option<(BlockId, BlockId)> {
        self.restored_roots.lock().take()
    }

    /// Commit notification from the header manager
    pub fn note_commit(&self, revnum: u64, seqnum: u64) {
        self.flushed_revnum.store(revnum, Ordering::Release);
        self.flushed_seqnum.store(seqnum, Ordering::Release);
    }

    /// Revision number of the last commit observed on this file
    pub fn flushed_revnum(&self) -> u64 {
        self.flushed_revnum.load(Ordering::Acquire)
    }

    /// Sequence number of the last commit observed on this file
    pub fn flushed_seqnum(&self) -> u64 {
        self.flushed_seqnum.load(Ordering::Acquire)
    }
}
