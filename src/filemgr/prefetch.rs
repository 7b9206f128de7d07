//! Prefetch agent
//!
//! An optional background worker that sequentially warms the block cache
//! after open, up to a configured time budget or until the whole committed
//! region is resident. Close requests an abort and joins the worker; the
//! worker checks the abort flag between blocks, so the acknowledgment is
//! prompt and close never blocks indefinitely.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel;
use parking_lot::Mutex;

use super::batch::{ReadBatch, QUEUE_DEPTH};
use super::FileHandle;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const ABORT: u8 = 2;

/// Worker state owned by the file handle
pub(crate) struct PrefetchState {
    status: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchState {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU8::new(IDLE),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == RUNNING
    }
}

/// Start the warm-up worker for `handle` if the config asks for one
pub(crate) fn spawn(handle: &Arc<FileHandle>) {
    let duration = handle.config.prefetch_duration;
    if duration.is_zero() || handle.last_commit_pos() == 0 {
        return;
    }
    if handle
        .prefetch
        .status
        .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let worker_handle = Arc::clone(handle);
    let worker = std::thread::spawn(move || run(worker_handle));
    *handle.prefetch.worker.lock() = Some(worker);
}

fn run(handle: Arc<FileHandle>) {
    let blocksize = handle.blocksize;
    let nblocks = handle.last_commit_pos() / blocksize as u64;
    let deadline = channel::after(handle.config.prefetch_duration);
    let mut batch = ReadBatch::new(QUEUE_DEPTH, blocksize);
    let mut warmed = 0usize;

    tracing::debug!(file = %handle.filename, nblocks, "prefetch started");

    for bid in 0..nblocks {
        if handle.prefetch.status.load(Ordering::Acquire) == ABORT {
            break;
        }
        if deadline.try_recv().is_ok() {
            break;
        }
        if handle.cache.get(bid).is_some() {
            continue;
        }
        if batch.push(bid) {
            match batch.drain(handle.file.as_ref(), &handle.cache) {
                Ok(n) => warmed += n,
                Err(e) => {
                    tracing::warn!(file = %handle.filename, "prefetch read failed: {}", e);
                    break;
                }
            }
        }
    }
    if !batch.is_empty() && handle.prefetch.status.load(Ordering::Acquire) != ABORT {
        if let Ok(n) = batch.drain(handle.file.as_ref(), &handle.cache) {
            warmed += n;
        }
    }

    tracing::debug!(file = %handle.filename, warmed, "prefetch stopped");
    handle.prefetch.status.store(IDLE, Ordering::Release);
}

/// Request abort and wait for the worker to acknowledge
pub(crate) fn abort_and_join(handle: &FileHandle) {
    let worker = {
        let mut slot = handle.prefetch.worker.lock();
        if handle.prefetch.status.load(Ordering::Acquire) == RUNNING {
            handle.prefetch.status.store(ABORT, Ordering::Release);
        }
        slot.take()
    };
    if let Some(worker) = worker {
        // the worker observes the flag between blocks, so this is bounded
        let _ = worker.join();
    }
}
