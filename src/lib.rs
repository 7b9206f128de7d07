//! # basalt
//!
//! Block-addressed file storage core for an embedded key-value engine:
//! - Fixed-size block allocation over a single append-only file
//! - Versioned commit headers with a backward rollback chain
//! - Sharded per-block locking and a single writer-commit mutex
//! - Online compaction lifecycle with stale-file chains and deferred removal
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Index trees / write-ahead log                  │
//! │                   (layers above basalt)                     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ block reads/writes · commits
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      FileHandle                             │
//! │   allocator · header manager · lifecycle · concurrency      │
//! └───────┬───────────────────────┬─────────────────────────────┘
//!         │                       │
//!         ▼                       ▼
//!  ┌─────────────┐         ┌─────────────┐
//!  │ Block cache │         │   FileOps   │
//!  │  (sharded)  │         │  (OS file)  │
//!  └─────────────┘         └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod ops;
pub mod cache;
pub mod wal;
pub mod stats;
pub mod filemgr;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BasaltError, Result};
pub use config::{CrcMode, FileConfig};
pub use filemgr::{FileHandle, FileStatus, OpenOutcome, RemovalPolicy};

// =============================================================================
// Core Types
// =============================================================================

/// Block address within a file; blocks are assigned monotonically
pub type BlockId = u64;

/// Sentinel for "no such block"
pub const BLOCK_NOT_FOUND: BlockId = u64::MAX;

/// Current version of basalt
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
