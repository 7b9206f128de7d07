//! Block cache
//!
//! A sharded, frequency-aware cache over fixed-size block payloads. Each
//! file handle owns one cache; entries are keyed by block id and purged when
//! a block is invalidated, reused, or the owning file closes.
//!
//! Eviction is second-chance: a victim with a nonzero access frequency is
//! demoted and re-queued instead of dropped, so blocks that keep getting
//! read survive a scan of cold ones.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::BlockId;

/// Maximum frequency an entry can accumulate
const MAX_FREQUENCY: u8 = 3;

struct CachedBlock {
    data: Bytes,
    freq: u8,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<BlockId, CachedBlock>,
    queue: VecDeque<BlockId>,
}

impl Shard {
    fn evict_one(&mut self) {
        while let Some(bid) = self.queue.pop_front() {
            match self.entries.get_mut(&bid) {
                Some(block) if block.freq > 0 => {
                    block.freq -= 1;
                    self.queue.push_back(bid);
                }
                Some(_) => {
                    self.entries.remove(&bid);
                    return;
                }
                // stale queue slot for an erased entry
                None => {}
            }
        }
    }
}

/// Sharded block cache with a block-count budget
pub struct BlockCache {
    shards: Vec<Mutex<Shard>>,
    capacity_per_shard: usize,
    blocksize: usize,
}

impl BlockCache {
    /// Create a cache holding at most `capacity_blocks` blocks
    pub fn new(capacity_blocks: usize, num_shards: u16, blocksize: usize) -> Self {
        let num_shards = num_shards.max(1) as usize;
        let capacity_per_shard = (capacity_blocks / num_shards).max(1);
        let shards = (0..num_shards).map(|_| Mutex::new(Shard::default())).collect();
        Self {
            shards,
            capacity_per_shard,
            blocksize,
        }
    }

    fn shard(&self, bid: BlockId) -> &Mutex<Shard> {
        &self.shards[(bid % self.shards.len() as u64) as usize]
    }

    /// Look up a block, bumping its access frequency on a hit
    pub fn get(&self, bid: BlockId) -> Option<Bytes> {
        let mut shard = self.shard(bid).lock();
        let block = shard.entries.get_mut(&bid)?;
        block.freq = (block.freq + 1).min(MAX_FREQUENCY);
        Some(block.data.clone())
    }

    /// Insert or overwrite a block
    pub fn insert(&self, bid: BlockId, data: Bytes) {
        let mut shard = self.shard(bid).lock();
        if shard.entries.len() >= self.capacity_per_shard && !shard.entries.contains_key(&bid) {
            shard.evict_one();
        }
        if shard.entries.insert(bid, CachedBlock { data, freq: 0 }).is_none() {
            shard.queue.push_back(bid);
        }
    }

    /// Drop a single block, returning whether it was present
    pub fn erase(&self, bid: BlockId) -> bool {
        // the queue slot is left stale and skipped by the evictor
        self.shard(bid).lock().entries.remove(&bid).is_some()
    }

    /// Drop every cached block for this file
    pub fn purge_all(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.queue.clear();
        }
    }

    /// Number of blocks currently resident
    pub fn used_blocks(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    /// Bytes currently resident
    pub fn used_space(&self) -> u64 {
        (self.used_blocks() * self.blocksize) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(fill: u8, len: usize) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BlockCache::new(8, 2, 64);
        cache.insert(1, block(0xAA, 64));
        cache.insert(2, block(0xBB, 64));

        assert_eq!(cache.get(1), Some(block(0xAA, 64)));
        assert_eq!(cache.get(2), Some(block(0xBB, 64)));
        assert_eq!(cache.get(3), None);
    }

    #[test]
    fn test_overwrite_replaces_data() {
        let cache = BlockCache::new(8, 1, 64);
        cache.insert(1, block(0x01, 64));
        cache.insert(1, block(0x02, 64));

        assert_eq!(cache.get(1), Some(block(0x02, 64)));
        assert_eq!(cache.used_blocks(), 1);
    }

    #[test]
    fn test_eviction_respects_budget() {
        let cache = BlockCache::new(4, 1, 64);
        for bid in 0..32 {
            cache.insert(bid, block(bid as u8, 64));
        }
        assert!(cache.used_blocks() <= 4);
    }

    #[test]
    fn test_hot_entry_survives_cold_scan() {
        let cache = BlockCache::new(4, 1, 64);
        cache.insert(0, block(0x00, 64));
        // heat it up
        for _ in 0..3 {
            cache.get(0);
        }
        for bid in 1..8 {
            cache.insert(bid, block(bid as u8, 64));
        }
        assert_eq!(cache.get(0), Some(block(0x00, 64)));
    }

    #[test]
    fn test_erase_and_purge() {
        let cache = BlockCache::new(8, 2, 64);
        cache.insert(1, block(0x01, 64));
        cache.insert(2, block(0x02, 64));

        assert!(cache.erase(1));
        assert!(!cache.erase(1));
        assert_eq!(cache.get(1), None);

        cache.purge_all();
        assert_eq!(cache.used_blocks(), 0);
        assert_eq!(cache.used_space(), 0);
    }
}
