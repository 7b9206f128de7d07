//! Tests for the commit header manager
//!
//! These tests verify:
//! - Commit protocol and revision numbering
//! - Header round-trips across close/reopen
//! - Backward walks along the header chain
//! - Corruption fallback to an older valid header
//! - Header recognition (`is_commit_header`) under both checksum modes

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use basalt::filemgr::is_commit_header;
use basalt::{BasaltError, CrcMode, FileConfig, FileHandle, BLOCK_NOT_FOUND};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_file(name: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(name);
    (temp_dir, path)
}

/// Write one data block and commit with the given payload
fn write_and_commit(file: &FileHandle, payload: &[u8]) -> u64 {
    let bid = file.alloc().unwrap();
    file.write_block(bid, &vec![bid as u8; file.blocksize()]).unwrap();
    file.update_header(payload).unwrap();
    file.commit().unwrap()
}

/// Flip bytes inside the given block of a closed file
fn corrupt_block(path: &Path, bid: u64, blocksize: usize) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(bid * blocksize as u64 + 10)).unwrap();
    file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Commit Protocol
// =============================================================================

#[test]
fn test_first_commit_has_revnum_one() {
    let (_temp, path) = setup_file("first_commit.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    assert!(file.get_header().is_none());
    assert_eq!(file.header_bid(), BLOCK_NOT_FOUND);

    let revnum = write_and_commit(file, b"first");
    assert_eq!(revnum, 1);

    let header = file.get_header().unwrap();
    assert_eq!(header.payload, b"first");
    assert_eq!(header.revnum, 1);

    file.close(true).unwrap();
}

#[test]
fn test_commit_roundtrip_with_roots_and_seqnum() {
    let (_temp, path) = setup_file("roundtrip.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    write_and_commit(file, b"base");
    let prior = file.header_revnum();

    file.set_seqnum(99);
    file.set_dirty_root(7, 11);
    let bid = file.alloc().unwrap();
    file.write_block(bid, &vec![0x55; file.blocksize()]).unwrap();
    file.update_header(b"payload-p").unwrap();
    file.commit().unwrap();

    let header = file.get_header().unwrap();
    assert_eq!(header.payload, b"payload-p");
    assert_eq!(header.seqnum, 99);
    assert_eq!(header.revnum, prior + 1);
    assert_eq!(file.dirty_root(), (7, 11));
    assert!(file.dirty_root_exist());

    file.close(true).unwrap();
}

#[test]
fn test_commit_headers_occupy_fresh_blocks() {
    let (_temp, path) = setup_file("fresh_blocks.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    write_and_commit(file, b"one");
    let first_bid = file.header_bid();
    write_and_commit(file, b"two");
    let second_bid = file.header_bid();

    assert_ne!(first_bid, second_bid);
    // the first header block is still intact and recognizable
    assert!(is_commit_header(&file.read(first_bid).unwrap()));

    file.close(true).unwrap();
}

#[test]
fn test_commit_without_staged_header_fails() {
    let (_temp, path) = setup_file("no_staged.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    assert!(matches!(file.commit(), Err(BasaltError::InvalidState(_))));

    file.close(true).unwrap();
}

#[test]
fn test_update_header_rejects_oversized_payload() {
    let (_temp, path) = setup_file("oversized.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    let too_big = vec![0u8; file.blocksize()];
    assert!(matches!(
        file.update_header(&too_big),
        Err(BasaltError::TooLarge { .. })
    ));

    file.close(true).unwrap();
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_header_survives_reopen() {
    let (_temp, path) = setup_file("reopen.db");
    {
        let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
        let file = &opened.handle;
        file.set_seqnum(5);
        file.set_dirty_root(21, 22);
        write_and_commit(file, b"persisted");
        file.close(true).unwrap();
    }

    let reopened = FileHandle::open(&path, FileConfig::default()).unwrap();
    assert!(!reopened.header_fallback);
    let file = &reopened.handle;

    let header = file.get_header().unwrap();
    assert_eq!(header.payload, b"persisted");
    assert_eq!(header.revnum, 1);
    assert_eq!(header.seqnum, 5);

    // the decoded dirty roots are handed back through the WAL link
    assert_eq!(file.wal().take_roots(), Some((21, 22)));
    assert_eq!(file.wal().take_roots(), None);

    file.close(true).unwrap();
}

#[test]
fn test_reopen_without_any_header_fails() {
    let (_temp, path) = setup_file("headerless.db");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();

    let result = FileHandle::open(&path, FileConfig::default());
    assert!(matches!(result, Err(BasaltError::NoHeader)));
}

#[test]
fn test_crc_mode_detected_on_reopen() {
    let (_temp, path) = setup_file("crc_legacy.db");
    let config = FileConfig::builder().crc_mode(CrcMode::Crc32).build();
    {
        let opened = FileHandle::open(&path, config).unwrap();
        write_and_commit(&opened.handle, b"legacy");
        opened.handle.close(true).unwrap();
    }

    // reopen with the current default mode still recognizes the file
    let reopened = FileHandle::open(&path, FileConfig::default()).unwrap();
    assert_eq!(reopened.handle.crc_mode(), CrcMode::Crc32);
    assert_eq!(reopened.handle.get_header().unwrap().payload, b"legacy");
    reopened.handle.close(true).unwrap();
}

// =============================================================================
// Header Chain
// =============================================================================

#[test]
fn test_fetch_prev_header_walks_backward() {
    let (_temp, path) = setup_file("chain.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    write_and_commit(file, b"rev-1");
    write_and_commit(file, b"rev-2");
    write_and_commit(file, b"rev-3");

    let current = file.header_bid();
    let prev = file.fetch_prev_header(current).unwrap().unwrap();
    assert_eq!(prev.revnum, 2);
    assert_eq!(prev.payload, b"rev-2");

    let prev2 = file.fetch_prev_header(prev.bid).unwrap().unwrap();
    assert_eq!(prev2.revnum, 1);
    assert_eq!(prev2.payload, b"rev-1");

    // the first revision has no predecessor
    assert!(file.fetch_prev_header(prev2.bid).unwrap().is_none());

    file.close(true).unwrap();
}

#[test]
fn test_fetch_header_decodes_historical_revision() {
    let (_temp, path) = setup_file("historical.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    write_and_commit(file, b"old-state");
    let old_bid = file.header_bid();
    write_and_commit(file, b"new-state");

    let old = file.fetch_header(old_bid).unwrap();
    assert_eq!(old.payload, b"old-state");
    assert_eq!(old.revnum, 1);

    file.close(true).unwrap();
}

#[test]
fn test_fetch_header_on_data_block_fails() {
    let (_temp, path) = setup_file("not_header.db");
    let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
    let file = &opened.handle;

    let bid = file.alloc().unwrap();
    file.write_block(bid, &vec![0x42; file.blocksize()]).unwrap();
    write_and_commit(file, b"h");

    assert!(matches!(
        file.fetch_header(bid),
        Err(BasaltError::ChecksumMismatch { .. })
    ));

    file.close(true).unwrap();
}

// =============================================================================
// Corruption Fallback
// =============================================================================

#[test]
fn test_open_falls_back_past_corrupt_header() {
    let (_temp, path) = setup_file("corrupt.db");
    let blocksize = FileConfig::default().blocksize;
    let latest_bid;
    {
        let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
        let file = &opened.handle;
        write_and_commit(file, b"good");
        write_and_commit(file, b"doomed");
        latest_bid = file.header_bid();
        file.close(true).unwrap();
    }

    corrupt_block(&path, latest_bid, blocksize);

    let reopened = FileHandle::open(&path, FileConfig::default()).unwrap();
    // the corruption is reported, and the previous valid header is live
    assert!(reopened.header_fallback);
    let header = reopened.handle.get_header().unwrap();
    assert_eq!(header.payload, b"good");
    assert_eq!(header.revnum, 1);
    reopened.handle.close(true).unwrap();
}

// =============================================================================
// Header Recognition
// =============================================================================

#[test]
fn test_is_commit_header_on_raw_blocks() {
    let (_temp, path) = setup_file("recognition.db");
    let blocksize = FileConfig::default().blocksize;
    let header_bid;
    let data_bid;
    {
        let opened = FileHandle::open(&path, FileConfig::default()).unwrap();
        let file = &opened.handle;
        data_bid = file.alloc().unwrap();
        file.write_block(data_bid, &vec![0u8; blocksize]).unwrap();
        file.update_header(b"marker").unwrap();
        file.commit().unwrap();
        header_bid = file.header_bid();
        file.close(true).unwrap();
    }

    let mut raw = std::fs::File::open(&path).unwrap();
    let mut block = vec![0u8; blocksize];

    raw.seek(SeekFrom::Start(header_bid * blocksize as u64)).unwrap();
    raw.read_exact(&mut block).unwrap();
    assert!(is_commit_header(&block));

    // an all-zero (never written) block is not a header
    raw.seek(SeekFrom::Start(data_bid * blocksize as u64)).unwrap();
    raw.read_exact(&mut block).unwrap();
    assert!(!is_commit_header(&block));
}
