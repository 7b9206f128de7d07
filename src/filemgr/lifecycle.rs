//! File lifecycle & compaction state machine
//!
//! A file is `Normal` until an online compaction picks it as the source;
//! the replacement opens as `CompactDest`, the two are linked under the
//! registry lock, and once the destination's first commit lands it is
//! promoted to `Normal` and becomes the live file for the path. The
//! superseded source drains its readers and moves to `RemovalPending`;
//! physical deletion is delegated to the registered `RemovalPolicy` so it
//! can happen immediately or in a background reclaim pass.
//!
//! Successive compactions produce a backward-discoverable chain of
//! superseded files (`very_old → old → current`). A reader holding a stale
//! handle is redirected forward along the chain instead of blocking the
//! compactor.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::FileConfig;
use crate::error::{BasaltError, Result};
use crate::ops::{self, FileOps, FsType, StdFileOps};
use crate::BlockId;

use super::{header, prefetch, registry, FileHandle};

/// Lifecycle state of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileStatus {
    /// Live file, no compaction in progress
    Normal = 0,
    /// Source of an in-flight compaction
    CompactSource = 1,
    /// Destination of an in-flight compaction, not yet committed
    CompactDest = 2,
    /// Superseded; physically removed once the last reference drains
    RemovalPending = 3,
}

impl FileStatus {
    pub(crate) fn from_u8(raw: u8) -> FileStatus {
        match raw {
            1 => FileStatus::CompactSource,
            2 => FileStatus::CompactDest,
            3 => FileStatus::RemovalPending,
            _ => FileStatus::Normal,
        }
    }
}

/// Strategy deciding when a superseded file is physically removed
///
/// Registered at process scope via `set_removal_policy`; the default
/// unlinks immediately.
pub trait RemovalPolicy: Send + Sync {
    /// Remove `path` now, or queue it for a later reclaim pass
    fn attempt_removal(&self, path: &Path) -> Result<()>;

    /// Whether `filename` is still awaiting a queued removal
    fn is_removal_pending(&self, filename: &str) -> bool;
}

/// Default policy: unlink as soon as the last reference drains
pub struct ImmediateRemoval;

impl RemovalPolicy for ImmediateRemoval {
    fn attempt_removal(&self, path: &Path) -> Result<()> {
        if ops::exists(path) {
            ops::unlink(path)?;
        }
        Ok(())
    }

    fn is_removal_pending(&self, _filename: &str) -> bool {
        false
    }
}

impl FileHandle {
    /// Current lifecycle status (lock-free)
    pub fn status(&self) -> FileStatus {
        FileStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: FileStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Update status and, optionally, the superseded filename recorded in
    /// subsequent commit headers
    ///
    /// Used by the compactor to promote a `CompactDest` file to `Normal`
    /// after its first commit.
    pub fn update_file_status(&self, status: FileStatus, old_filename: Option<&str>) {
        self.set_status(status);
        if let Some(name) = old_filename {
            *self.old_filename.lock() = Some(name.to_string());
        }
    }

    /// Filename of the file this one superseded, if any
    pub fn old_filename(&self) -> Option<String> {
        self.old_filename.lock().clone()
    }

    /// Handle that superseded this one, once compaction has linked it
    pub fn new_file(&self) -> Option<Arc<FileHandle>> {
        self.new_file.get().cloned()
    }

    /// Fence flag for an in-progress rollback
    pub fn set_rollback(&self, on: bool) {
        self.rollback_on.store(on, Ordering::Release);
    }

    pub fn is_rollback_on(&self) -> bool {
        self.rollback_on.load(Ordering::Acquire)
    }

    /// Marker that this file is being compacted in place
    pub fn set_in_place_compaction(&self, on: bool) {
        self.in_place_compaction.store(on, Ordering::Release);
    }

    pub fn is_in_place_compaction_set(&self) -> bool {
        self.in_place_compaction.load(Ordering::Acquire)
    }
}

/// Enter compaction: `old` becomes the source, `new` the destination, and
/// the forward link between them is established
///
/// Runs under the open-registry lock so a concurrent opener cannot observe
/// a half-linked pair. The forward link is permanent for `old`'s lifetime.
pub fn set_compaction_state(old: &Arc<FileHandle>, new: &Arc<FileHandle>) -> Result<()> {
    let registry = registry::global();
    let _table = registry.table_lock();

    if old.status() == FileStatus::RemovalPending {
        return Err(BasaltError::InvalidState(format!(
            "{} is pending removal and cannot be a compaction source",
            old.filename
        )));
    }
    if old.new_file.set(Arc::clone(new)).is_err() {
        return Err(BasaltError::InvalidState(format!(
            "{} is already linked to a compaction destination",
            old.filename
        )));
    }
    old.set_status(FileStatus::CompactSource);
    new.set_status(FileStatus::CompactDest);

    tracing::info!(
        source = %old.filename,
        dest = %new.filename,
        "compaction started"
    );
    Ok(())
}

/// Finish compaction on the source side: mark `old` superseded and exclude
/// it from the live registry
///
/// Readers still holding `old` drain at their own pace; the physical unlink
/// happens through the removal policy when the last reference goes away (or
/// immediately, if none remain).
pub fn remove_pending(old: &Arc<FileHandle>, new: &Arc<FileHandle>) -> Result<()> {
    let registry = registry::global();
    let mut table = registry.table_lock();

    old.set_status(FileStatus::RemovalPending);
    *new.old_filename.lock() = Some(old.filename.clone());
    table.remove(&old.filename);

    let drained = old.ref_count() == 0;
    drop(table);

    tracing::info!(
        source = %old.filename,
        dest = %new.filename,
        drained,
        "compaction source marked for removal"
    );

    if drained {
        prefetch::abort_and_join(old);
        old.cache.purge_all();
        registry.policy().attempt_removal(Path::new(&old.filename))?;
    }
    Ok(())
}

/// Follow the stale-file chain forward to the terminal, currently live
/// handle
pub fn search_stale_links(start: &Arc<FileHandle>) -> Arc<FileHandle> {
    let mut current = Arc::clone(start);
    while let Some(next) = current.new_file.get() {
        current = Arc::clone(next);
    }
    current
}

/// Rewrite a historical file's current header so a reader holding a very
/// old handle can locate equivalent data in `new`
///
/// `redirect_fn` receives the header payload and remaps whatever embedded
/// block references the layer above keeps in it. The rewritten header is
/// flushed before this returns. This is the one sanctioned in-place update
/// of a committed header block.
pub fn redirect_old_file<F>(
    very_old: &Arc<FileHandle>,
    new: &Arc<FileHandle>,
    redirect_fn: F,
) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>, &FileHandle),
{
    let _writer = very_old.writer.lock();

    let bid = very_old.header.bid.load(Ordering::Acquire);
    if very_old.header.size.load(Ordering::Acquire) == 0 || bid == crate::BLOCK_NOT_FOUND {
        return Err(BasaltError::NoHeader);
    }

    let mut payload = very_old.header.data.lock().clone();
    redirect_fn(&mut payload, new.as_ref());

    // the payload now points forward; the persisted backward link stays ours
    let own_old_filename = very_old.old_filename.lock().clone();
    let stats = crate::stats::StatsSnapshot::capture(&very_old.stats, &very_old.op_stats);
    let block = header::encode_block(
        very_old.blocksize,
        very_old.crc_mode,
        very_old.header.revnum.load(Ordering::Acquire),
        very_old.header.seqnum.load(Ordering::Acquire),
        very_old.header.dirty_idtree_root.load(Ordering::Acquire),
        very_old.header.dirty_seqtree_root.load(Ordering::Acquire),
        own_old_filename.as_deref(),
        &stats,
        &payload,
    )?;

    {
        let _guard = very_old.block_locks.lock(bid);
        very_old
            .file
            .write_at(&block, bid * very_old.blocksize as u64)?;
    }
    very_old.file.sync()?;
    very_old.cache.insert(bid, bytes::Bytes::from(block));

    let mut staged = very_old.header.data.lock();
    very_old.header.size.store(payload.len(), Ordering::Release);
    *staged = payload;

    tracing::debug!(
        old = %very_old.filename,
        new = %new.filename,
        bid,
        "redirected stale header"
    );
    Ok(())
}

/// Whether block-range cloning between `src` and `dst` can use filesystem
/// copy-on-write support
pub fn is_cow_supported(src: &FileHandle, dst: &FileHandle) -> bool {
    matches!(
        (src.fs_type, dst.fs_type),
        (FsType::Btrfs, FsType::Btrfs) | (FsType::Ext4Cow, FsType::Ext4Cow)
    )
}

/// Duplicate `nblocks` contiguous blocks from `src` into `dst`
///
/// The destination range must already be allocated and uncommitted. Uses
/// the kernel's range clone on COW filesystems, falling back to read+write.
pub fn copy_file_range(
    src: &FileHandle,
    dst: &FileHandle,
    src_bid: BlockId,
    dst_bid: BlockId,
    nblocks: u64,
) -> Result<()> {
    if nblocks == 0 {
        return Ok(());
    }
    if src.blocksize != dst.blocksize {
        return Err(BasaltError::InvalidState(
            "source and destination block sizes differ".to_string(),
        ));
    }
    let bs = src.blocksize as u64;
    if src_bid * bs + nblocks * bs > src.pos() {
        return Err(BasaltError::InvalidState(
            "source range extends past the append position".to_string(),
        ));
    }
    if !dst.is_writable(dst_bid) || !dst.is_writable(dst_bid + nblocks - 1) {
        return Err(BasaltError::InvalidState(
            "destination range is not writable".to_string(),
        ));
    }

    if is_cow_supported(src, dst)
        && ops::clone_range(
            src.file.as_ref(),
            dst.file.as_ref(),
            src_bid * bs,
            dst_bid * bs,
            nblocks * bs,
        )?
    {
        // cloned ranges bypass the cache; drop any stale destination entries
        for i in 0..nblocks {
            dst.cache.erase(dst_bid + i);
        }
        return Ok(());
    }

    for i in 0..nblocks {
        let block = src.read(src_bid + i)?;
        let _guard = dst.block_locks.lock(dst_bid + i);
        dst.file.write_at(&block, (dst_bid + i) * bs)?;
        dst.cache.insert(dst_bid + i, block);
    }
    Ok(())
}

/// Move the compaction source's operation counters onto the destination
pub fn migrate_stats(old: &FileHandle, new: &FileHandle) {
    new.op_stats.migrate_from(&old.op_stats);
    new.op_stats.incr_compacts();
}

/// Permanently delete `path` and, transitively, every file in its
/// compaction-superseded chain
///
/// `destroy_set` carries the names already processed so a chain is never
/// destroyed twice.
pub fn destroy_file(
    path: &Path,
    config: &FileConfig,
    destroy_set: &mut HashSet<String>,
) -> Result<()> {
    let key = super::canonical_key(path)?;
    if !destroy_set.insert(key.clone()) {
        return Ok(());
    }

    let mut superseded: Option<String> = None;
    {
        let registry = registry::global();
        let mut table = registry.table_lock();
        match table.get(&key).cloned() {
            Some(handle) => {
                if handle.ref_count() > 0 {
                    return Err(BasaltError::InvalidState(format!(
                        "cannot destroy {}: still open",
                        key
                    )));
                }
                superseded = handle.old_filename.lock().clone();
                prefetch::abort_and_join(&handle);
                handle.cache.purge_all();
                table.remove(&key);
            }
            None if ops::exists(path) => {
                // not resident: recover the chain link from the newest on-disk header
                let file = StdFileOps::open(path, false, true, false)?;
                let size = file.len()?;
                if let Some(scan) = header::scan_newest(&file, config.blocksize, size)? {
                    superseded = scan.header.old_filename;
                }
            }
            None => {}
        }
    }

    if ops::exists(path) {
        ops::unlink(path)?;
        tracing::info!(file = %key, "destroyed file");
    }

    if let Some(old_name) = superseded {
        destroy_file(Path::new(&old_name), config, destroy_set)?;
    }
    Ok(())
}
