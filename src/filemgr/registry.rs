//! Process-wide open-file registry
//!
//! One guarded table maps canonical paths to live handles so that
//! "check if already open, else create" is atomic across threads: the whole
//! open path runs under the table's mutex, and duplicate handles for one
//! path cannot exist. The removal policy deciding whether superseded files
//! are unlinked immediately or reclaimed later is registered here as well.
//!
//! The registry is initialized explicitly via `init` (or lazily on first
//! open) and torn down explicitly via `shutdown`; open and close hold its
//! guard only for the lookup-or-insert window.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{BasaltError, Result};

use super::lifecycle::{ImmediateRemoval, RemovalPolicy};
use super::{prefetch, FileHandle};

pub(crate) struct Registry {
    table: Mutex<HashMap<String, Arc<FileHandle>>>,
    policy: RwLock<Arc<dyn RemovalPolicy>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            policy: RwLock::new(Arc::new(ImmediateRemoval)),
        }
    }

    pub(crate) fn table_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<FileHandle>>> {
        self.table.lock()
    }

    pub(crate) fn policy(&self) -> Arc<dyn RemovalPolicy> {
        self.policy.read().clone()
    }
}

/// Initialize the registry before first use
///
/// Opening a file initializes it lazily as well; calling `init` up front
/// makes the lifecycle explicit and is idempotent.
pub fn init() {
    let _ = global();
}

pub(crate) fn global() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Register the process-wide removal policy for superseded files
pub fn set_removal_policy(policy: Arc<dyn RemovalPolicy>) {
    *global().policy.write() = policy;
}

/// Whether `filename` is still subject to a pending deferred removal
pub fn is_removal_pending(filename: &str) -> bool {
    global().policy().is_removal_pending(filename)
}

/// Total bytes resident across every open file's block cache
pub fn cache_used_space() -> u64 {
    global()
        .table_lock()
        .values()
        .map(|handle| handle.cache.used_space())
        .sum()
}

/// Tear the registry down
///
/// Fails if any handle is still referenced; resident zero-reference handles
/// are quiesced and dropped.
pub fn shutdown() -> Result<()> {
    let registry = global();
    let mut table = registry.table_lock();

    let busy: Vec<&String> = table
        .iter()
        .filter(|(_, handle)| handle.ref_count() > 0)
        .map(|(name, _)| name)
        .collect();
    if !busy.is_empty() {
        return Err(BasaltError::InvalidState(format!(
            "cannot shut down: {} file(s) still open",
            busy.len()
        )));
    }

    for handle in table.values() {
        prefetch::abort_and_join(handle);
        handle.cache.purge_all();
    }
    let drained = table.len();
    table.clear();
    tracing::debug!(drained, "file registry shut down");
    Ok(())
}
