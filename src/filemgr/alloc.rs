//! Block allocator
//!
//! The append position is the single source of truth: allocation is a
//! fetch-add (or compare-and-swap for the conditional form), so concurrent
//! allocations never overlap and no lock is held. A block address is
//! writable without copy-on-write hazards iff it lies in
//! `[last_commit, pos)`; everything below `last_commit` is frozen by the
//! last commit.

use std::sync::atomic::Ordering;

use crate::error::{BasaltError, Result};
use crate::BlockId;

use super::FileHandle;

impl FileHandle {
    /// Reserve the next block and advance the append position by one block
    pub fn alloc(&self) -> Result<BlockId> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        let offset = self.pos.fetch_add(self.blocksize as u64, Ordering::AcqRel);
        Ok(offset / self.blocksize as u64)
    }

    /// Reserve `nblocks` contiguous blocks; returns `(begin, end)` inclusive
    pub fn alloc_multiple(&self, nblocks: u64) -> Result<(BlockId, BlockId)> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        if nblocks == 0 {
            return Err(BasaltError::InvalidState(
                "cannot allocate zero blocks".to_string(),
            ));
        }
        let offset = self
            .pos
            .fetch_add(nblocks * self.blocksize as u64, Ordering::AcqRel);
        let begin = offset / self.blocksize as u64;
        Ok((begin, begin + nblocks - 1))
    }

    /// Reserve `nblocks` contiguous blocks only if the append position still
    /// equals the caller's expectation
    ///
    /// A racing allocation by another writer surfaces as
    /// `AllocationRace { expected, actual }`; the caller retries with the
    /// observed position rather than allocating from a stale offset.
    pub fn alloc_multiple_cond(
        &self,
        expected_next: BlockId,
        nblocks: u64,
    ) -> Result<(BlockId, BlockId)> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        if nblocks == 0 {
            return Err(BasaltError::InvalidState(
                "cannot allocate zero blocks".to_string(),
            ));
        }
        let expected_offset = expected_next * self.blocksize as u64;
        let new_offset = expected_offset + nblocks * self.blocksize as u64;
        match self.pos.compare_exchange(
            expected_offset,
            new_offset,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok((expected_next, expected_next + nblocks - 1)),
            Err(actual) => Err(BasaltError::AllocationRace {
                expected: expected_next,
                actual: actual / self.blocksize as u64,
            }),
        }
    }

    /// Reverse a not-yet-committed allocation
    ///
    /// Succeeds iff `bid` lies in the uncommitted window
    /// `[last_commit, pos)`: the append position is moved back to `bid` and
    /// the block leaves the cache, so a later `alloc` may hand it out again.
    /// Blocks in the committed region are irreversible and return false.
    pub fn invalidate_block(&self, bid: BlockId) -> bool {
        let offset = bid * self.blocksize as u64;
        loop {
            let pos = self.pos.load(Ordering::Acquire);
            let last_commit = self.last_commit.load(Ordering::Acquire);
            if offset < last_commit || offset >= pos {
                return false;
            }
            if self
                .pos
                .compare_exchange(pos, offset, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.cache.erase(bid);
                return true;
            }
            // a racing alloc moved pos; re-validate against the new window
        }
    }

    /// Whether `bid` can be mutated in place without copy-on-write hazards
    pub fn is_writable(&self, bid: BlockId) -> bool {
        if self.config.readonly {
            return false;
        }
        let offset = bid * self.blocksize as u64;
        // pos and last_commit only grow between commits, and last_commit is
        // always derived from a previous pos, so two plain loads suffice
        offset < self.pos.load(Ordering::Acquire)
            && offset >= self.last_commit.load(Ordering::Acquire)
    }

    /// Block id the next `alloc` will return
    pub fn next_alloc_block(&self) -> BlockId {
        self.pos.load(Ordering::Acquire) / self.blocksize as u64
    }

    /// Append position in bytes
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Last committed position in bytes; everything below is immutable
    pub fn last_commit_pos(&self) -> u64 {
        self.last_commit.load(Ordering::Acquire)
    }
}
