//! OS file boundary
//!
//! Everything basalt does to a real file goes through the `FileOps` trait:
//! positioned block reads and writes, sub-block writes for header rewrites,
//! durability flushes, and truncation. `StdFileOps` is the production
//! implementation on top of `std::fs::File` positioned I/O.
//!
//! The module also hosts the filesystem-type probe used to pick a
//! copy-on-write strategy for cross-file block cloning.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::Result;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Filesystem capability with respect to block-range cloning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    /// No copy-on-write support; cloning falls back to read+write
    NoCow,
    /// ext4-like: shared-extent copies work but carry caveats across files
    Ext4Cow,
    /// btrfs-like: native copy-on-write block cloning
    Btrfs,
}

/// Abstraction over one open file
///
/// All offsets are absolute byte offsets. Implementations must be safe to
/// call from multiple threads concurrently; positioned I/O never moves a
/// shared cursor.
pub trait FileOps: Send + Sync {
    /// Read exactly `buf.len()` bytes at `offset`
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush file contents and metadata to stable storage
    fn sync(&self) -> Result<()>;

    /// Truncate (or extend) the file to `len` bytes
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current file length in bytes
    fn len(&self) -> Result<u64>;

    /// Raw descriptor for range-clone syscalls, when the platform has one
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<i32> {
        None
    }
}

/// Production `FileOps` over `std::fs::File`
pub struct StdFileOps {
    file: File,
}

impl StdFileOps {
    /// Open (or create) a file for block I/O
    ///
    /// With `sync_writes`, the file is opened `O_SYNC` on unix so every write
    /// reaches stable storage before returning; the commit path still issues
    /// an explicit `sync()` as the durability boundary.
    pub fn open(path: &Path, create: bool, readonly: bool, sync_writes: bool) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if !readonly {
            opts.write(true).create(create);
        }

        #[cfg(unix)]
        if sync_writes && !readonly {
            opts.custom_flags(libc::O_SYNC);
        }
        #[cfg(not(unix))]
        let _ = sync_writes;

        let file = opts.open(path)?;
        Ok(Self { file })
    }
}

impl FileOps for StdFileOps {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            self.file.read_exact_at(buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt as _;
            let mut read = 0usize;
            while read < buf.len() {
                let n = self.file.seek_read(&mut buf[read..], offset + read as u64)?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                }
                read += n;
            }
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            self.file.write_all_at(buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt as _;
            let mut written = 0usize;
            while written < buf.len() {
                let n = self
                    .file
                    .seek_write(&buf[written..], offset + written as u64)?;
                written += n;
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<i32> {
        Some(self.file.as_raw_fd())
    }
}

/// Probe the filesystem hosting `path` for copy-on-write support
#[cfg(target_os = "linux")]
pub fn filesystem_type(path: &Path) -> FsType {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    const BTRFS_SUPER_MAGIC: i64 = 0x9123_683e;
    const EXT4_SUPER_MAGIC: i64 = 0xef53;

    // statfs wants an existing path; probe the parent for files not yet created
    let probe = if path.exists() {
        path
    } else {
        path.parent().unwrap_or(Path::new("."))
    };
    let Ok(cpath) = CString::new(probe.as_os_str().as_bytes()) else {
        return FsType::NoCow;
    };

    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rv = unsafe { libc::statfs(cpath.as_ptr(), &mut stat) };
    if rv != 0 {
        return FsType::NoCow;
    }

    match stat.f_type as i64 {
        BTRFS_SUPER_MAGIC => FsType::Btrfs,
        EXT4_SUPER_MAGIC => FsType::Ext4Cow,
        _ => FsType::NoCow,
    }
}

/// Non-Linux platforms get no copy-on-write fast path
#[cfg(not(target_os = "linux"))]
pub fn filesystem_type(_path: &Path) -> FsType {
    FsType::NoCow
}

/// Clone `len` bytes from `src` to `dst` using the kernel's range-clone
/// support when both sides expose a descriptor
///
/// Returns `Ok(true)` when the kernel performed the clone, `Ok(false)` when
/// the platform or filesystem cannot, so the caller falls back to read+write.
#[cfg(target_os = "linux")]
pub fn clone_range(
    src: &dyn FileOps,
    dst: &dyn FileOps,
    src_offset: u64,
    dst_offset: u64,
    len: u64,
) -> Result<bool> {
    let (Some(src_fd), Some(dst_fd)) = (src.raw_fd(), dst.raw_fd()) else {
        return Ok(false);
    };

    let mut remaining = len as i64;
    let mut src_off = src_offset as i64;
    let mut dst_off = dst_offset as i64;
    while remaining > 0 {
        let n = unsafe {
            libc::copy_file_range(
                src_fd,
                &mut src_off,
                dst_fd,
                &mut dst_off,
                remaining as usize,
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            // EXDEV / EOPNOTSUPP: filesystem refused, caller falls back
            return match err.raw_os_error() {
                Some(libc::EXDEV) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Ok(false),
                _ => Err(err.into()),
            };
        }
        if n == 0 {
            return Ok(false);
        }
        remaining -= n as i64;
    }
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
pub fn clone_range(
    _src: &dyn FileOps,
    _dst: &dyn FileOps,
    _src_offset: u64,
    _dst_offset: u64,
    _len: u64,
) -> Result<bool> {
    Ok(false)
}

/// Remove a file from the filesystem
pub fn unlink(path: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    Ok(())
}

/// Whether a path currently exists
pub fn exists(path: &Path) -> bool {
    path.exists()
}
