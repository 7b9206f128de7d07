//! Configuration for a basalt file
//!
//! All knobs are fixed at open time for a given handle; reopening with a
//! different configuration does not retroactively change an already-resident
//! handle.

use std::time::Duration;

use crate::error::{BasaltError, Result};

/// Checksum mode a file is using.
///
/// Legacy files carry plain CRC32 header checksums; current files use
/// xxh3 truncated to 32 bits. The mode of an existing file is detected on
/// open by validating its newest header under each mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcMode {
    /// CRC32 (IEEE), the original on-disk format
    Crc32,
    /// xxh3-64 truncated to 32 bits, the current format
    Xxh3,
}

/// Open-time configuration for a single file handle
#[derive(Debug, Clone)]
pub struct FileConfig {
    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------
    /// Fixed block size in bytes; every allocation and read is one block
    pub blocksize: usize,

    /// Chunk size used by the index layer for key prefixes (recorded only;
    /// basalt itself never splits blocks into chunks)
    pub chunksize: usize,

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------
    /// Block cache budget, in blocks
    pub cache_blocks: usize,

    /// Shard count for the block cache
    pub num_cache_shards: u16,

    // -------------------------------------------------------------------------
    // Open flags
    // -------------------------------------------------------------------------
    /// Create the file if it does not exist
    pub create: bool,

    /// Open read-only; all mutation paths fail with `ReadOnly`
    pub readonly: bool,

    /// fsync on every commit (durability boundary)
    pub sync: bool,

    // -------------------------------------------------------------------------
    // Collaborators
    // -------------------------------------------------------------------------
    /// Shard count handed to the in-memory write-ahead log index
    pub num_wal_shards: u16,

    /// Time budget for the background cache warm-up on open; zero disables it
    pub prefetch_duration: Duration,

    /// Checksum mode for newly created files
    pub crc_mode: CrcMode,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            blocksize: 4096,
            chunksize: 8,
            cache_blocks: 1024,
            num_cache_shards: 8,
            create: true,
            readonly: false,
            sync: true,
            num_wal_shards: 8,
            prefetch_duration: Duration::ZERO,
            crc_mode: CrcMode::Xxh3,
        }
    }
}

impl FileConfig {
    /// Create a new config builder
    pub fn builder() -> FileConfigBuilder {
        FileConfigBuilder::default()
    }

    /// Validate invariants the rest of the crate relies on
    pub fn validate(&self) -> Result<()> {
        if self.blocksize < 512 || !self.blocksize.is_power_of_two() {
            return Err(BasaltError::Config(format!(
                "blocksize must be a power of two >= 512, got {}",
                self.blocksize
            )));
        }
        if self.num_cache_shards == 0 {
            return Err(BasaltError::Config(
                "num_cache_shards must be nonzero".to_string(),
            ));
        }
        if self.readonly && self.create {
            return Err(BasaltError::Config(
                "readonly and create are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for FileConfig
#[derive(Default)]
pub struct FileConfigBuilder {
    config: FileConfig,
}

impl FileConfigBuilder {
    /// Set the block size (power of two, >= 512)
    pub fn blocksize(mut self, bytes: usize) -> Self {
        self.config.blocksize = bytes;
        self
    }

    /// Set the index layer's chunk size
    pub fn chunksize(mut self, bytes: usize) -> Self {
        self.config.chunksize = bytes;
        self
    }

    /// Set the block cache budget, in blocks
    pub fn cache_blocks(mut self, blocks: usize) -> Self {
        self.config.cache_blocks = blocks;
        self
    }

    /// Set the block cache shard count
    pub fn num_cache_shards(mut self, shards: u16) -> Self {
        self.config.num_cache_shards = shards;
        self
    }

    /// Create the file if missing
    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    /// Open read-only
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = readonly;
        self
    }

    /// fsync on every commit
    pub fn sync(mut self, sync: bool) -> Self {
        self.config.sync = sync;
        self
    }

    /// Set the WAL shard count handed to the index layer
    pub fn num_wal_shards(mut self, shards: u16) -> Self {
        self.config.num_wal_shards = shards;
        self
    }

    /// Set the prefetch time budget (zero disables prefetch)
    pub fn prefetch_duration(mut self, duration: Duration) -> Self {
        self.config.prefetch_duration = duration;
        self
    }

    /// Set the checksum mode for newly created files
    pub fn crc_mode(mut self, mode: CrcMode) -> Self {
        self.config.crc_mode = mode;
        self
    }

    pub fn build(self) -> FileConfig {
        self.config
    }
}
