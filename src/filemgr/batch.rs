//! Batched block reads
//!
//! A small queue of positioned reads drained in one pass, used by the
//! prefetch agent to warm the cache without issuing one syscall's worth of
//! bookkeeping per block. This is the portable fallback shape of the
//! platform async-I/O batch; correctness never depends on it.

use bytes::Bytes;

use crate::cache::BlockCache;
use crate::error::Result;
use crate::ops::FileOps;
use crate::BlockId;

/// Default number of queued reads per drain
pub(crate) const QUEUE_DEPTH: usize = 64;

/// Queue of block reads drained together
pub(crate) struct ReadBatch {
    depth: usize,
    blocksize: usize,
    queue: Vec<BlockId>,
}

impl ReadBatch {
    pub(crate) fn new(depth: usize, blocksize: usize) -> Self {
        Self {
            depth: depth.max(1),
            blocksize,
            queue: Vec::with_capacity(depth.max(1)),
        }
    }

    /// Queue one block; returns true when the batch is full and must drain
    pub(crate) fn push(&mut self, bid: BlockId) -> bool {
        self.queue.push(bid);
        self.queue.len() >= self.depth
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Read every queued block into the cache; returns the blocks read
    pub(crate) fn drain(&mut self, file: &dyn FileOps, cache: &BlockCache) -> Result<usize> {
        let mut done = 0;
        for bid in self.queue.drain(..) {
            let mut buf = vec![0u8; self.blocksize];
            file.read_at(&mut buf, bid * self.blocksize as u64)?;
            cache.insert(bid, Bytes::from(buf));
            done += 1;
        }
        Ok(done)
    }
}
