//! Per-keyspace statistics bookkeeping
//!
//! Live counters are atomics updated by the engine layers above; a frozen
//! `StatsSnapshot` of the default keyspace rides inside every commit header
//! so the counters survive restarts without a scan.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Document and size statistics for one keyspace
#[derive(Debug, Default)]
pub struct KvsStats {
    ndocs: AtomicU64,
    ndeletes: AtomicU64,
    nlivenodes: AtomicU64,
    datasize: AtomicU64,
}

/// Operation counters for one keyspace
#[derive(Debug, Default)]
pub struct KvsOpStats {
    num_sets: AtomicU64,
    num_dels: AtomicU64,
    num_gets: AtomicU64,
    num_commits: AtomicU64,
    num_compacts: AtomicU64,
}

/// A statistics attribute addressable by delta updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatAttr {
    Docs,
    Deletes,
    LiveNodes,
    DataSize,
}

impl KvsStats {
    /// Apply a signed delta to one attribute
    pub fn update(&self, attr: StatAttr, delta: i64) {
        let counter = match attr {
            StatAttr::Docs => &self.ndocs,
            StatAttr::Deletes => &self.ndeletes,
            StatAttr::LiveNodes => &self.nlivenodes,
            StatAttr::DataSize => &self.datasize,
        };
        if delta >= 0 {
            counter.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            counter.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
        }
    }

    pub fn ndocs(&self) -> u64 {
        self.ndocs.load(Ordering::Relaxed)
    }

    pub fn datasize(&self) -> u64 {
        self.datasize.load(Ordering::Relaxed)
    }

    /// Replace the live counters wholesale (header restore path)
    pub fn restore(&self, snapshot: &StatsSnapshot) {
        self.ndocs.store(snapshot.ndocs, Ordering::Relaxed);
        self.ndeletes.store(snapshot.ndeletes, Ordering::Relaxed);
        self.nlivenodes.store(snapshot.nlivenodes, Ordering::Relaxed);
        self.datasize.store(snapshot.datasize, Ordering::Relaxed);
    }
}

impl KvsOpStats {
    pub fn incr_sets(&self) {
        self.num_sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dels(&self) {
        self.num_dels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_gets(&self) {
        self.num_gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_commits(&self) {
        self.num_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_compacts(&self) {
        self.num_compacts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_commits(&self) -> u64 {
        self.num_commits.load(Ordering::Relaxed)
    }

    /// Move counters from a compaction source onto its destination
    pub fn migrate_from(&self, old: &KvsOpStats) {
        self.num_sets
            .fetch_add(old.num_sets.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.num_dels
            .fetch_add(old.num_dels.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.num_gets
            .fetch_add(old.num_gets.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.num_commits
            .fetch_add(old.num_commits.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.num_compacts
            .fetch_add(old.num_compacts.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    fn restore(&self, snapshot: &StatsSnapshot) {
        self.num_sets.store(snapshot.num_sets, Ordering::Relaxed);
        self.num_dels.store(snapshot.num_dels, Ordering::Relaxed);
        self.num_gets.store(snapshot.num_gets, Ordering::Relaxed);
        self.num_commits.store(snapshot.num_commits, Ordering::Relaxed);
        self.num_compacts.store(snapshot.num_compacts, Ordering::Relaxed);
    }
}

/// Frozen statistics form embedded in commit headers (bincode)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub ndocs: u64,
    pub ndeletes: u64,
    pub nlivenodes: u64,
    pub datasize: u64,
    pub num_sets: u64,
    pub num_dels: u64,
    pub num_gets: u64,
    pub num_commits: u64,
    pub num_compacts: u64,
}

impl StatsSnapshot {
    /// Freeze the live counters of the default keyspace
    pub fn capture(stats: &KvsStats, op_stats: &KvsOpStats) -> Self {
        Self {
            ndocs: stats.ndocs.load(Ordering::Relaxed),
            ndeletes: stats.ndeletes.load(Ordering::Relaxed),
            nlivenodes: stats.nlivenodes.load(Ordering::Relaxed),
            datasize: stats.datasize.load(Ordering::Relaxed),
            num_sets: op_stats.num_sets.load(Ordering::Relaxed),
            num_dels: op_stats.num_dels.load(Ordering::Relaxed),
            num_gets: op_stats.num_gets.load(Ordering::Relaxed),
            num_commits: op_stats.num_commits.load(Ordering::Relaxed),
            num_compacts: op_stats.num_compacts.load(Ordering::Relaxed),
        }
    }

    /// Restore live counters from a decoded header
    pub fn apply(&self, stats: &KvsStats, op_stats: &KvsOpStats) {
        stats.restore(self);
        op_stats.restore(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_capture() {
        let stats = KvsStats::default();
        let ops = KvsOpStats::default();

        stats.update(StatAttr::Docs, 10);
        stats.update(StatAttr::Docs, -3);
        stats.update(StatAttr::DataSize, 4096);
        ops.incr_sets();
        ops.incr_commits();

        let snap = StatsSnapshot::capture(&stats, &ops);
        assert_eq!(snap.ndocs, 7);
        assert_eq!(snap.datasize, 4096);
        assert_eq!(snap.num_sets, 1);
        assert_eq!(snap.num_commits, 1);
    }

    #[test]
    fn test_snapshot_roundtrip_restores_counters() {
        let stats = KvsStats::default();
        let ops = KvsOpStats::default();
        stats.update(StatAttr::Docs, 42);
        ops.incr_compacts();

        let snap = StatsSnapshot::capture(&stats, &ops);
        let encoded = bincode::serialize(&snap).unwrap();
        let decoded: StatsSnapshot = bincode::deserialize(&encoded).unwrap();

        let stats2 = KvsStats::default();
        let ops2 = KvsOpStats::default();
        decoded.apply(&stats2, &ops2);
        assert_eq!(stats2.ndocs(), 42);
        assert_eq!(StatsSnapshot::capture(&stats2, &ops2), snap);
    }

    #[test]
    fn test_migrate_drains_source() {
        let old = KvsOpStats::default();
        let new = KvsOpStats::default();
        old.incr_commits();
        old.incr_commits();
        new.incr_commits();

        new.migrate_from(&old);
        assert_eq!(new.num_commits(), 3);
        assert_eq!(old.num_commits(), 0);
    }
}
