//! Commit header management
//!
//! A commit header is one block recording a consistent snapshot: revision
//! number, sequence number, the write-ahead log's dirty-root block ids,
//! per-keyspace statistics, the superseded filename when the file came out
//! of a compaction, and an opaque payload owned by the layer above.
//!
//! ## Block layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Front                                                       │
//! │ ┌────────┬───────┬───────┬─────────┬─────────┬──────┬─────┐ │
//! │ │PayLen 2│Rev  8 │Seq  8 │IdRoot 8 │SeqRoot 8│OldFn2│Sta 2│ │
//! │ └────────┴───────┴───────┴─────────┴─────────┴──────┴─────┘ │
//! │ stats snapshot (bincode) │ old filename │ payload           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ ...unused...                                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Trailer (last 13 bytes of the block)                        │
//! │ ┌──────────┬──────────────────────┬───────────┐             │
//! │ │ CRC (4)  │ Magic + version (8)  │ Marker (1)│             │
//! │ └──────────┴──────────────────────┴───────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A block is recognized as a commit header iff the marker byte, the
//! versioned magic, and the checksum over the declared front length all
//! hold. The checksum is validated under each known mode, which is also how
//! the mode of an existing file is detected on open.
//!
//! Committed headers are immutable: every commit allocates a fresh block,
//! and only after the durability flush succeeds is the current-header
//! pointer advanced. Historical headers stay in place, forming a backward
//! chain walked by `fetch_prev_header` for rollback.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::CrcMode;
use crate::error::{BasaltError, Result};
use crate::ops::FileOps;
use crate::stats::StatsSnapshot;
use crate::{BlockId, BLOCK_NOT_FOUND};

use super::FileHandle;

/// Marker byte in the last position of every header block
const HEADER_MARKER: u8 = 0xEE;

/// Magic with the format version in the low byte
const MAGIC_BASE: u64 = 0x6261_7361_6c74_0000; // "basalt"
const MAGIC_MASK: u64 = !0xFFu64;

/// Current on-disk format version
pub const FORMAT_VERSION: u64 = 2;

/// Fixed front fields: payload len (2), revnum (8), seqnum (8),
/// two dirty roots (8 + 8), old-filename len (2), stats len (2)
const FRONT_FIXED: usize = 38;

/// Trailer: crc (4), magic (8), marker (1)
const TRAILER_LEN: usize = 13;

/// Checksum under the given mode
pub(crate) fn checksum(mode: CrcMode, data: &[u8]) -> u32 {
    match mode {
        CrcMode::Crc32 => crc32fast::hash(data),
        CrcMode::Xxh3 => xxhash_rust::xxh3::xxh3_64(data) as u32,
    }
}

/// In-memory commit header state, owned by the file handle
pub(crate) struct HeaderState {
    /// Staged payload length; 0 means no header has ever been staged
    pub(crate) size: AtomicUsize,
    pub(crate) revnum: AtomicU64,
    pub(crate) seqnum: AtomicU64,
    /// Block id of the current committed header
    pub(crate) bid: AtomicU64,
    pub(crate) dirty_idtree_root: AtomicU64,
    pub(crate) dirty_seqtree_root: AtomicU64,
    /// Staged opaque payload, owned by the layer above
    pub(crate) data: Mutex<Vec<u8>>,
}

impl HeaderState {
    pub(crate) fn new() -> Self {
        Self {
            size: AtomicUsize::new(0),
            revnum: AtomicU64::new(0),
            seqnum: AtomicU64::new(0),
            bid: AtomicU64::new(BLOCK_NOT_FOUND),
            dirty_idtree_root: AtomicU64::new(BLOCK_NOT_FOUND),
            dirty_seqtree_root: AtomicU64::new(BLOCK_NOT_FOUND),
            data: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn from_decoded(decoded: &DecodedHeader, bid: BlockId) -> Self {
        Self {
            size: AtomicUsize::new(decoded.payload.len()),
            revnum: AtomicU64::new(decoded.revnum),
            seqnum: AtomicU64::new(decoded.seqnum),
            bid: AtomicU64::new(bid),
            dirty_idtree_root: AtomicU64::new(decoded.dirty_idtree_root),
            dirty_seqtree_root: AtomicU64::new(decoded.dirty_seqtree_root),
            data: Mutex::new(decoded.payload.clone()),
        }
    }
}

/// A fully decoded commit header
#[derive(Debug, Clone)]
pub struct DecodedHeader {
    pub bid: BlockId,
    pub payload: Vec<u8>,
    pub revnum: u64,
    pub seqnum: u64,
    pub dirty_idtree_root: BlockId,
    pub dirty_seqtree_root: BlockId,
    pub old_filename: Option<String>,
    pub stats: StatsSnapshot,
    pub version: u64,
    pub crc_mode: CrcMode,
}

/// Current-header view returned by `FileHandle::get_header`
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub payload: Vec<u8>,
    pub bid: BlockId,
    pub revnum: u64,
    pub seqnum: u64,
}

/// Encode a header block
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_block(
    blocksize: usize,
    crc_mode: CrcMode,
    revnum: u64,
    seqnum: u64,
    dirty_idtree_root: BlockId,
    dirty_seqtree_root: BlockId,
    old_filename: Option<&str>,
    stats: &StatsSnapshot,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let stats_bytes = bincode::serialize(stats)
        .map_err(|e| BasaltError::Corruption(format!("stats encode failed: {}", e)))?;
    let old_fn = old_filename.map(str::as_bytes).unwrap_or(&[]);

    let front_total = FRONT_FIXED + stats_bytes.len() + old_fn.len() + payload.len();
    let max = (blocksize - TRAILER_LEN - FRONT_FIXED).saturating_sub(stats_bytes.len() + old_fn.len());
    if front_total > blocksize - TRAILER_LEN {
        return Err(BasaltError::TooLarge {
            len: payload.len(),
            max,
        });
    }

    let mut block = vec![0u8; blocksize];
    block[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    block[2..10].copy_from_slice(&revnum.to_le_bytes());
    block[10..18].copy_from_slice(&seqnum.to_le_bytes());
    block[18..26].copy_from_slice(&dirty_idtree_root.to_le_bytes());
    block[26..34].copy_from_slice(&dirty_seqtree_root.to_le_bytes());
    block[34..36].copy_from_slice(&(old_fn.len() as u16).to_le_bytes());
    block[36..38].copy_from_slice(&(stats_bytes.len() as u16).to_le_bytes());

    let mut at = FRONT_FIXED;
    block[at..at + stats_bytes.len()].copy_from_slice(&stats_bytes);
    at += stats_bytes.len();
    block[at..at + old_fn.len()].copy_from_slice(old_fn);
    at += old_fn.len();
    block[at..at + payload.len()].copy_from_slice(payload);

    let crc = checksum(crc_mode, &block[..front_total]);
    let magic = MAGIC_BASE | FORMAT_VERSION;
    block[blocksize - 13..blocksize - 9].copy_from_slice(&crc.to_le_bytes());
    block[blocksize - 9..blocksize - 1].copy_from_slice(&magic.to_le_bytes());
    block[blocksize - 1] = HEADER_MARKER;

    Ok(block)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4]))
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8]))
}

/// Validate marker, magic, and checksum; returns the matching checksum mode
/// and the format version when the block is a genuine commit header
pub(crate) fn validate_block(buf: &[u8]) -> Option<(CrcMode, u64)> {
    let bs = buf.len();
    if bs < FRONT_FIXED + TRAILER_LEN {
        return None;
    }
    if buf[bs - 1] != HEADER_MARKER {
        return None;
    }
    let magic = read_u64(buf, bs - 9);
    if magic & MAGIC_MASK != MAGIC_BASE {
        return None;
    }
    let version = magic & 0xFF;
    if version == 0 || version > FORMAT_VERSION {
        return None;
    }

    let payload_len = read_u16(buf, 0) as usize;
    let old_fn_len = read_u16(buf, 34) as usize;
    let stats_len = read_u16(buf, 36) as usize;
    let front_total = FRONT_FIXED + stats_len + old_fn_len + payload_len;
    if front_total > bs - TRAILER_LEN {
        return None;
    }

    let stored = read_u32(buf, bs - 13);
    for mode in [CrcMode::Crc32, CrcMode::Xxh3] {
        if checksum(mode, &buf[..front_total]) == stored {
            return Some((mode, version));
        }
    }
    None
}

/// Whether a stored block is a commit header
///
/// True iff the marker, versioned magic, and checksum over the declared size
/// all hold, under either checksum mode the format has ever used.
pub fn is_commit_header(buf: &[u8]) -> bool {
    validate_block(buf).is_some()
}

/// Decode a block already known (or suspected) to be a header
pub(crate) fn decode_block(buf: &[u8], bid: BlockId) -> Result<DecodedHeader> {
    let Some((crc_mode, version)) = validate_block(buf) else {
        return Err(BasaltError::ChecksumMismatch { bid });
    };

    let payload_len = read_u16(buf, 0) as usize;
    let revnum = read_u64(buf, 2);
    let seqnum = read_u64(buf, 10);
    let dirty_idtree_root = read_u64(buf, 18);
    let dirty_seqtree_root = read_u64(buf, 26);
    let old_fn_len = read_u16(buf, 34) as usize;
    let stats_len = read_u16(buf, 36) as usize;

    let mut at = FRONT_FIXED;
    let stats: StatsSnapshot = bincode::deserialize(&buf[at..at + stats_len])
        .map_err(|e| BasaltError::Corruption(format!("stats decode failed at block {}: {}", bid, e)))?;
    at += stats_len;
    let old_filename = if old_fn_len > 0 {
        let name = std::str::from_utf8(&buf[at..at + old_fn_len])
            .map_err(|_| BasaltError::Corruption(format!("bad old filename at block {}", bid)))?;
        Some(name.to_string())
    } else {
        None
    };
    at += old_fn_len;
    let payload = buf[at..at + payload_len].to_vec();

    Ok(DecodedHeader {
        bid,
        payload,
        revnum,
        seqnum,
        dirty_idtree_root,
        dirty_seqtree_root,
        old_filename,
        stats,
        version,
        crc_mode,
    })
}

/// Result of the backward header scan on open
pub(crate) struct HeaderScan {
    pub(crate) header: DecodedHeader,
    /// True when one or more trailing blocks failed validation before a
    /// valid header was found
    pub(crate) fallback: bool,
}

/// Scan backward from the end of the file for the newest valid header
pub(crate) fn scan_newest(
    file: &dyn FileOps,
    blocksize: usize,
    file_size: u64,
) -> Result<Option<HeaderScan>> {
    let nblocks = file_size / blocksize as u64;
    if nblocks == 0 {
        return Ok(None);
    }

    let mut buf = vec![0u8; blocksize];
    let mut fallback = false;
    for bid in (0..nblocks).rev() {
        file.read_at(&mut buf, bid * blocksize as u64)?;
        match decode_block(&buf, bid) {
            Ok(header) => return Ok(Some(HeaderScan { header, fallback })),
            Err(_) => {
                fallback = true;
            }
        }
    }
    Ok(None)
}

impl FileHandle {
    /// Stage an opaque header payload for the next commit
    ///
    /// Returns the revision number the next commit will carry.
    pub fn update_header(&self, payload: &[u8]) -> Result<u64> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        if payload.is_empty() {
            return Err(BasaltError::InvalidState(
                "header payload must not be empty".to_string(),
            ));
        }
        let max = self.blocksize - FRONT_FIXED - TRAILER_LEN;
        if payload.len() > max {
            return Err(BasaltError::TooLarge {
                len: payload.len(),
                max,
            });
        }
        let mut data = self.header.data.lock();
        data.clear();
        data.extend_from_slice(payload);
        self.header.size.store(payload.len(), Ordering::Release);
        Ok(self.header.revnum.load(Ordering::Acquire) + 1)
    }

    /// Current header, or `None` before the first commit
    pub fn get_header(&self) -> Option<HeaderInfo> {
        if self.header.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(HeaderInfo {
            payload: self.header.data.lock().clone(),
            bid: self.header.bid.load(Ordering::Acquire),
            revnum: self.header.revnum.load(Ordering::Acquire),
            seqnum: self.header.seqnum.load(Ordering::Acquire),
        })
    }

    /// Block id of the current committed header, or `BLOCK_NOT_FOUND`
    pub fn header_bid(&self) -> BlockId {
        if self.header.size.load(Ordering::Acquire) == 0 {
            return BLOCK_NOT_FOUND;
        }
        self.header.bid.load(Ordering::Acquire)
    }

    /// Revision number of the last commit (0 before the first)
    pub fn header_revnum(&self) -> u64 {
        self.header.revnum.load(Ordering::Acquire)
    }

    pub fn seqnum(&self) -> u64 {
        self.header.seqnum.load(Ordering::Acquire)
    }

    pub fn set_seqnum(&self, seqnum: u64) {
        self.header.seqnum.store(seqnum, Ordering::Release);
    }

    /// Record the write-ahead log's dirty roots for the next commit
    pub fn set_dirty_root(&self, idtree_root: BlockId, seqtree_root: BlockId) {
        self.header.dirty_idtree_root.store(idtree_root, Ordering::Release);
        self.header.dirty_seqtree_root.store(seqtree_root, Ordering::Release);
    }

    pub fn dirty_root(&self) -> (BlockId, BlockId) {
        (
            self.header.dirty_idtree_root.load(Ordering::Acquire),
            self.header.dirty_seqtree_root.load(Ordering::Acquire),
        )
    }

    pub fn dirty_root_exist(&self) -> bool {
        let (id, seq) = self.dirty_root();
        id != BLOCK_NOT_FOUND || seq != BLOCK_NOT_FOUND
    }

    /// Commit the staged header, blocking on the writer lock
    ///
    /// Returns the new revision number.
    pub fn commit(&self) -> Result<u64> {
        let guard = self.writer.lock();
        self.commit_locked(guard)
    }

    /// Commit without blocking; `Busy` when another commit is in flight
    pub fn try_commit(&self) -> Result<u64> {
        match self.writer.try_lock() {
            Some(guard) => self.commit_locked(guard),
            None => Err(BasaltError::Busy),
        }
    }

    fn commit_locked(&self, _guard: super::locks::WriterGuard<'_>) -> Result<u64> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        if self.header.size.load(Ordering::Acquire) == 0 {
            return Err(BasaltError::InvalidState(
                "no header payload staged for commit".to_string(),
            ));
        }

        let pos_before = self.pos();
        let bid = self.alloc()?;
        let new_revnum = self.header.revnum.load(Ordering::Acquire) + 1;
        let seqnum = self.seqnum();
        let (idroot, seqroot) = self.dirty_root();
        let stats = crate::stats::StatsSnapshot::capture(&self.stats, &self.op_stats);
        let old_filename = self.old_filename.lock().clone();
        let payload = self.header.data.lock().clone();

        let block = match encode_block(
            self.blocksize,
            self.crc_mode,
            new_revnum,
            seqnum,
            idroot,
            seqroot,
            old_filename.as_deref(),
            &stats,
            &payload,
        ) {
            Ok(block) => block,
            Err(e) => {
                self.invalidate_block(bid);
                return Err(e);
            }
        };

        {
            let _block_guard = self.block_locks.lock(bid);
            if let Err(e) = self.file.write_at(&block, bid * self.blocksize as u64) {
                self.invalidate_block(bid);
                return Err(e);
            }
        }

        if self.config.sync {
            if let Err(e) = self.file.sync() {
                // no partial header may become current; roll the allocation back
                self.invalidate_block(bid);
                tracing::warn!(file = %self.filename, "commit sync failed: {}", e);
                return Err(e);
            }
        }

        self.cache.insert(bid, bytes::Bytes::from(block));
        self.header.bid.store(bid, Ordering::Release);
        self.header.revnum.store(new_revnum, Ordering::Release);
        self.last_commit.store(pos_before, Ordering::Release);
        self.wal.note_commit(new_revnum, seqnum);
        self.op_stats.incr_commits();

        tracing::debug!(
            file = %self.filename,
            revnum = new_revnum,
            bid,
            "committed header"
        );
        Ok(new_revnum)
    }

    /// Decode an arbitrary historical header for rollback-to-point-in-time
    pub fn fetch_header(&self, bid: BlockId) -> Result<DecodedHeader> {
        let block = self.read(bid)?;
        decode_block(&block, bid)
    }

    /// Walk strictly backward from `bid` to the chronologically previous
    /// header; `None` when `bid` belongs to the first revision
    pub fn fetch_prev_header(&self, bid: BlockId) -> Result<Option<DecodedHeader>> {
        let mut buf = vec![0u8; self.blocksize];
        for candidate in (0..bid).rev() {
            self.file.read_at(&mut buf, candidate * self.blocksize as u64)?;
            if let Ok(header) = decode_block(&buf, candidate) {
                return Ok(Some(header));
            }
        }
        Ok(None)
    }
}
