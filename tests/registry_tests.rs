//! Tests for the process-wide open-file registry
//!
//! The registry and the removal policy are process-global, so this file
//! exercises them in one sequential test per concern rather than racing
//! global state across parallel tests.

use std::path::Path;
use std::sync::Arc;

use basalt::filemgr::{self, remove_pending, set_compaction_state, RemovalPolicy};
use basalt::{BasaltError, FileConfig, FileHandle, Result};
use parking_lot::Mutex;
use tempfile::TempDir;

fn write_and_commit(file: &FileHandle, payload: &[u8]) {
    let bid = file.alloc().unwrap();
    file.write_block(bid, &vec![bid as u8; file.blocksize()]).unwrap();
    file.update_header(payload).unwrap();
    file.commit().unwrap();
}

/// Records removal requests instead of unlinking, and keeps the names
/// pending until the test drains them
struct DeferringPolicy {
    pending: Mutex<Vec<String>>,
}

impl RemovalPolicy for DeferringPolicy {
    fn attempt_removal(&self, path: &Path) -> Result<()> {
        self.pending
            .lock()
            .push(path.to_string_lossy().into_owned());
        Ok(())
    }

    fn is_removal_pending(&self, filename: &str) -> bool {
        self.pending.lock().iter().any(|p| p == filename)
    }
}

#[test]
fn test_registry_lifecycle_and_deferred_removal() {
    filemgr::init();

    let temp = TempDir::new().unwrap();
    let path_a = temp.path().join("reg_a.db");
    let path_b = temp.path().join("reg_b.db");

    // ---- resident handles and shutdown gating -----------------------------

    let a = FileHandle::open(&path_a, FileConfig::default()).unwrap().handle;
    write_and_commit(&a, b"a");
    assert!(filemgr::cache_used_space() > 0);

    // shutdown refuses while a reference is live
    assert!(matches!(
        filemgr::shutdown(),
        Err(BasaltError::InvalidState(_))
    ));

    // close without cache cleanup: the handle stays resident for fast reopen
    a.close(false).unwrap();
    let rejoined = FileHandle::open(&path_a, FileConfig::default()).unwrap().handle;
    assert!(Arc::ptr_eq(&a, &rejoined));
    rejoined.close(false).unwrap();

    // ---- deferred removal through an injected policy ----------------------

    let policy = Arc::new(DeferringPolicy {
        pending: Mutex::new(Vec::new()),
    });
    filemgr::set_removal_policy(policy.clone());

    let old = FileHandle::open(&path_a, FileConfig::default()).unwrap().handle;
    let new = FileHandle::open(&path_b, FileConfig::default()).unwrap().handle;
    write_and_commit(&new, b"b");

    set_compaction_state(&old, &new).unwrap();
    remove_pending(&old, &new).unwrap();
    old.close(true).unwrap();

    // the policy deferred the unlink: the file is still on disk, and the
    // name reports as pending so an open cannot resurrect it
    assert!(path_a.exists());
    assert!(filemgr::is_removal_pending(old.filename()));
    assert!(matches!(
        FileHandle::open(&path_a, FileConfig::default()),
        Err(BasaltError::InvalidState(_))
    ));

    // drain the reclaim queue the way a background pass would
    for name in policy.pending.lock().drain(..) {
        std::fs::remove_file(&name).unwrap();
    }
    assert!(!path_a.exists());

    new.close(true).unwrap();
    drop(old);

    // ---- clean shutdown ---------------------------------------------------

    filemgr::shutdown().unwrap();
    assert_eq!(filemgr::cache_used_space(), 0);
}
