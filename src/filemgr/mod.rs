//! File manager
//!
//! The core of basalt: one `FileHandle` per on-disk file, owning the file's
//! block layout, commit header, caches, and locks.
//!
//! ## Responsibilities
//! - Allocate and serialize fixed-size blocks (append-only positions)
//! - Maintain the versioned commit header and its backward chain
//! - Enforce concurrency discipline for simultaneous readers/writers
//! - Track lifecycle across online compaction and deferred removal
//!
//! ## Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 process-wide registry                     │
//! │            (canonical path → Arc<FileHandle>)             │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────────┐
//! │                      FileHandle                           │
//! │  ┌───────────┐ ┌──────────────┐ ┌────────────────────┐   │
//! │  │ allocator │ │ header/commit│ │ lifecycle/compaction│  │
//! │  └─────┬─────┘ └──────┬───────┘ └─────────┬──────────┘   │
//! │        │              │                    │              │
//! │  ┌─────▼──────────────▼────────────────────▼──────────┐  │
//! │  │   sharded block locks · writer lock · block cache  │  │
//! │  └────────────────────────┬───────────────────────────┘  │
//! │                           │                               │
//! │                    ┌──────▼──────┐                        │
//! │                    │   FileOps   │  (positioned OS I/O)   │
//! │                    └─────────────┘                        │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod alloc;
mod batch;
mod header;
mod lifecycle;
mod locks;
mod prefetch;
mod registry;

pub use header::{is_commit_header, DecodedHeader, HeaderInfo, FORMAT_VERSION};
pub use lifecycle::{
    copy_file_range, destroy_file, is_cow_supported, migrate_stats, redirect_old_file,
    remove_pending, search_stale_links, set_compaction_state, FileStatus, ImmediateRemoval,
    RemovalPolicy,
};
pub use registry::{cache_used_space, init, is_removal_pending, set_removal_policy, shutdown};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::BlockCache;
use crate::config::{CrcMode, FileConfig};
use crate::error::{BasaltError, Result};
use crate::ops::{self, FileOps, FsType, StdFileOps};
use crate::stats::{KvsOpStats, KvsStats};
use crate::wal::WalLink;
use crate::BlockId;

use header::HeaderState;
use locks::{BlockLocks, WriterLock};
use prefetch::PrefetchState;

/// Guard for the commit critical section, handed to the engine layer
pub struct CommitGuard<'a> {
    _inner: locks::WriterGuard<'a>,
}

/// Result of opening a file
pub struct OpenOutcome {
    pub handle: Arc<FileHandle>,
    /// True when the newest header block failed validation and the open
    /// recovered an older header from the backward chain
    pub header_fallback: bool,
}

/// One managed on-disk file
///
/// ## Concurrency model
/// - `pos`, `last_commit`, `status`: atomics, readable without any lock
/// - allocation: fetch-add / compare-and-swap on `pos`, never locked
/// - block I/O: sharded per-block locks; unrelated blocks never contend
/// - commit: the single writer lock; block I/O continues outside it
/// - open/close: the process-wide registry mutex
/// - reference count: its own small mutex, independent of I/O locks
pub struct FileHandle {
    /// Canonical path string; also the registry key
    filename: String,
    path: PathBuf,
    config: FileConfig,
    blocksize: usize,
    crc_mode: CrcMode,
    /// On-disk format version the file was written with
    version: u64,
    fs_type: FsType,
    file: Box<dyn FileOps>,

    ref_count: Mutex<u32>,
    /// Append position in bytes; monotone except through `invalidate_block`
    pos: AtomicU64,
    /// Everything below this byte offset is frozen by the last commit
    last_commit: AtomicU64,
    status: AtomicU8,
    rollback_on: AtomicBool,
    in_place_compaction: AtomicBool,

    header: HeaderState,
    /// Name of the file this one superseded via compaction
    old_filename: Mutex<Option<String>>,
    /// Forward link to the file that superseded this one; set once under
    /// the registry lock, never cleared
    new_file: OnceLock<Arc<FileHandle>>,

    block_locks: BlockLocks,
    writer: WriterLock,
    cache: BlockCache,
    wal: WalLink,
    stats: KvsStats,
    op_stats: KvsOpStats,
    prefetch: PrefetchState,
}

/// Canonical registry key for a path; works for files not yet created
pub(crate) fn canonical_key(path: &Path) -> Result<String> {
    let canonical = if path.exists() {
        std::fs::canonicalize(path)?
    } else {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path.file_name().ok_or_else(|| {
            BasaltError::Config(format!("invalid file path: {}", path.display()))
        })?;
        std::fs::canonicalize(parent)?.join(name)
    };
    Ok(canonical.to_string_lossy().into_owned())
}

impl FileHandle {
    /// Open (or create) a file, or join an already-open handle
    ///
    /// The first opener constructs the handle and inserts it into the
    /// process-wide registry; subsequent openers for the same canonical
    /// path increment the reference count and receive the existing handle.
    pub fn open(path: impl AsRef<Path>, config: FileConfig) -> Result<OpenOutcome> {
        config.validate()?;
        let path = path.as_ref();
        let key = canonical_key(path)?;

        let registry = registry::global();
        let mut table = registry.table_lock();

        if let Some(existing) = table.get(&key) {
            if existing.status() == FileStatus::RemovalPending {
                return Err(BasaltError::InvalidState(format!(
                    "{} is pending removal; follow its stale chain instead",
                    key
                )));
            }
            *existing.ref_count.lock() += 1;
            return Ok(OpenOutcome {
                handle: Arc::clone(existing),
                header_fallback: false,
            });
        }

        // a lazily deleted predecessor must not be resurrected by an open
        if registry.policy().is_removal_pending(&key) {
            return Err(BasaltError::InvalidState(format!(
                "{} is awaiting deferred removal",
                key
            )));
        }

        let (handle, header_fallback) = Self::build(path, key.clone(), config)?;
        table.insert(key, Arc::clone(&handle));
        drop(table);

        prefetch::spawn(&handle);
        Ok(OpenOutcome {
            handle,
            header_fallback,
        })
    }

    fn build(path: &Path, key: String, config: FileConfig) -> Result<(Arc<Self>, bool)> {
        let file: Box<dyn FileOps> = Box::new(StdFileOps::open(
            path,
            config.create,
            config.readonly,
            false,
        )?);
        let size = file.len()?;
        let blocksize = config.blocksize;

        let scan = if size >= blocksize as u64 {
            header::scan_newest(file.as_ref(), blocksize, size)?
        } else {
            None
        };

        let wal = WalLink::new(config.num_wal_shards);
        let stats = KvsStats::default();
        let op_stats = KvsOpStats::default();

        let (header_state, crc_mode, version, pos, old_filename, fallback) = match scan {
            Some(scan) => {
                let decoded = &scan.header;
                if scan.fallback {
                    tracing::warn!(
                        file = %key,
                        recovered_revnum = decoded.revnum,
                        "newest header corrupt; fell back along the header chain"
                    );
                }
                let pos = (decoded.bid + 1) * blocksize as u64;
                if size > pos && !config.readonly {
                    // trailing blocks past the recovered header are garbage
                    file.truncate(pos)?;
                    tracing::warn!(file = %key, from = size, to = pos, "truncated trailing blocks");
                }
                wal.adopt_roots(decoded.dirty_idtree_root, decoded.dirty_seqtree_root);
                decoded.stats.apply(&stats, &op_stats);
                (
                    HeaderState::from_decoded(decoded, decoded.bid),
                    decoded.crc_mode,
                    decoded.version,
                    pos,
                    decoded.old_filename.clone(),
                    scan.fallback,
                )
            }
            None if size == 0 => (
                HeaderState::new(),
                config.crc_mode,
                FORMAT_VERSION,
                0,
                None,
                false,
            ),
            None => return Err(BasaltError::NoHeader),
        };

        let cache = BlockCache::new(config.cache_blocks, config.num_cache_shards, blocksize);
        let fs_type = ops::filesystem_type(path);

        let handle = Arc::new(FileHandle {
            filename: key.clone(),
            path: path.to_path_buf(),
            blocksize,
            crc_mode,
            version,
            fs_type,
            file,
            ref_count: Mutex::new(1),
            pos: AtomicU64::new(pos),
            last_commit: AtomicU64::new(pos),
            status: AtomicU8::new(FileStatus::Normal as u8),
            rollback_on: AtomicBool::new(false),
            in_place_compaction: AtomicBool::new(false),
            header: header_state,
            old_filename: Mutex::new(old_filename),
            new_file: OnceLock::new(),
            block_locks: BlockLocks::new(),
            writer: WriterLock::new(),
            cache,
            wal,
            stats,
            op_stats,
            prefetch: PrefetchState::new(),
            config,
        });

        tracing::info!(file = %key, size, revnum = handle.header_revnum(), "opened file");
        Ok((handle, fallback))
    }

    /// Close one reference
    ///
    /// At zero references the handle is quiesced: prefetch is aborted, dirty
    /// OS buffers are flushed, and the handle either leaves the registry
    /// (`cleanup_cache_onclose`, or a pending removal, which also unlinks
    /// through the removal policy) or stays resident with its cache warm for
    /// a fast reopen.
    pub fn close(&self, cleanup_cache_onclose: bool) -> Result<()> {
        let registry = registry::global();
        let mut table = registry.table_lock();

        {
            let mut count = self.ref_count.lock();
            if *count == 0 {
                return Err(BasaltError::InvalidState(format!(
                    "{}: close without a matching open",
                    self.filename
                )));
            }
            *count -= 1;
            if *count > 0 {
                return Ok(());
            }
        }

        prefetch::abort_and_join(self);
        if !self.config.readonly {
            self.file.sync()?;
        }

        if self.status() == FileStatus::RemovalPending {
            self.cache.purge_all();
            table.remove(&self.filename);
            let policy = registry.policy();
            drop(table);
            policy.attempt_removal(Path::new(&self.filename))?;
            tracing::info!(file = %self.filename, "closed and removed pending file");
        } else if cleanup_cache_onclose {
            self.cache.purge_all();
            table.remove(&self.filename);
            tracing::debug!(file = %self.filename, "closed and evicted");
        } else {
            tracing::debug!(file = %self.filename, "closed, handle stays resident");
        }
        Ok(())
    }

    // =========================================================================
    // Block I/O
    // =========================================================================

    /// Read one block, consulting the cache before the file
    pub fn read(&self, bid: BlockId) -> Result<Bytes> {
        let offset = bid * self.blocksize as u64;
        if offset >= self.pos() {
            return Err(BasaltError::InvalidState(format!(
                "read of unallocated block {}",
                bid
            )));
        }
        if let Some(block) = self.cache.get(bid) {
            return Ok(block);
        }

        let _guard = self.block_locks.lock(bid);
        // another reader may have filled the cache while we waited
        if let Some(block) = self.cache.get(bid) {
            return Ok(block);
        }
        let mut buf = vec![0u8; self.blocksize];
        self.file.read_at(&mut buf, offset)?;
        let block = Bytes::from(buf);
        self.cache.insert(bid, block.clone());
        Ok(block)
    }

    /// Write one whole block
    ///
    /// The block must lie in the writable window `[last_commit, pos)`;
    /// anything below `last_commit` is frozen by the last commit.
    pub fn write_block(&self, bid: BlockId, data: &[u8]) -> Result<()> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        if data.len() != self.blocksize {
            return Err(BasaltError::InvalidState(format!(
                "block write of {} bytes, blocksize is {}",
                data.len(),
                self.blocksize
            )));
        }
        if !self.is_writable(bid) {
            return Err(BasaltError::InvalidState(format!(
                "block {} is outside the writable window",
                bid
            )));
        }

        let _guard = self.block_locks.lock(bid);
        self.file.write_at(data, bid * self.blocksize as u64)?;
        self.cache.insert(bid, Bytes::copy_from_slice(data));
        Ok(())
    }

    /// Write a sub-block range
    ///
    /// Unlike `write_block` this does not require the block to be in the
    /// writable window: header redirection legitimately patches a committed
    /// header block. Crash consistency of such writes is the caller's
    /// responsibility.
    pub fn write_offset(&self, bid: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        if self.config.readonly {
            return Err(BasaltError::ReadOnly);
        }
        if offset + data.len() > self.blocksize {
            return Err(BasaltError::InvalidState(format!(
                "sub-block write [{}, {}) exceeds blocksize {}",
                offset,
                offset + data.len(),
                self.blocksize
            )));
        }

        let _guard = self.block_locks.lock(bid);
        self.file
            .write_at(data, bid * self.blocksize as u64 + offset as u64)?;
        if let Some(cached) = self.cache.get(bid) {
            let mut patched = cached.to_vec();
            patched[offset..offset + data.len()].copy_from_slice(data);
            self.cache.insert(bid, Bytes::from(patched));
        }
        Ok(())
    }

    /// Flush file contents to stable storage without committing
    pub fn sync(&self) -> Result<()> {
        if self.config.readonly {
            return Ok(());
        }
        self.file.sync()
    }

    /// Drop every cached block for this file
    pub fn remove_all_buffer_blocks(&self) {
        self.cache.purge_all();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Canonical filename (the registry key)
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }

    /// On-disk format version this file carries
    pub fn format_version(&self) -> u64 {
        self.version
    }

    pub fn fs_type(&self) -> FsType {
        self.fs_type
    }

    /// Current logical open count
    pub fn ref_count(&self) -> u32 {
        *self.ref_count.lock()
    }

    /// Whether a commit is in flight right now
    pub fn is_writer_busy(&self) -> bool {
        self.writer.is_locked()
    }

    /// Enter the commit critical section without committing
    ///
    /// Serializes a multi-operation write section against commits and other
    /// guard holders. `commit` takes the same lock internally, so it must
    /// not be called while the guard is held.
    pub fn writer_lock(&self) -> CommitGuard<'_> {
        CommitGuard {
            _inner: self.writer.lock(),
        }
    }

    /// Non-blocking variant of `writer_lock`; `None` while a commit or
    /// another guard holder is inside
    pub fn try_writer_lock(&self) -> Option<CommitGuard<'_>> {
        self.writer.try_lock().map(|inner| CommitGuard { _inner: inner })
    }

    /// Link to the in-memory write-ahead log index
    pub fn wal(&self) -> &WalLink {
        &self.wal
    }

    /// Default-keyspace document statistics
    pub fn stats(&self) -> &KvsStats {
        &self.stats
    }

    /// Default-keyspace operation counters
    pub fn op_stats(&self) -> &KvsOpStats {
        &self.op_stats
    }

    /// Bytes resident in this file's block cache
    pub fn cache_space(&self) -> u64 {
        self.cache.used_space()
    }

    /// Whether the prefetch worker is currently warming the cache
    pub fn is_prefetch_running(&self) -> bool {
        self.prefetch.is_running()
    }
}
