//! Error types for basalt
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using BasaltError
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Unified error type for basalt operations
#[derive(Debug, Error)]
pub enum BasaltError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch at block {bid}")]
    ChecksumMismatch { bid: u64 },

    #[error("File has no commit header")]
    NoHeader,

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    #[error("Allocation raced: expected next block {expected}, found {actual}")]
    AllocationRace { expected: u64, actual: u64 },

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Writer is busy: another commit is in flight")]
    Busy,

    // -------------------------------------------------------------------------
    // State Errors
    // -------------------------------------------------------------------------
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("File is read-only")]
    ReadOnly,

    #[error("Header payload too large: {len} bytes, at most {max} fit in a block")]
    TooLarge { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
