//! Benchmarks for basalt file manager operations

use basalt::{FileConfig, FileHandle};
use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

fn filemgr_benchmarks(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();

    // fsync dominates otherwise; the bench measures the manager, not the disk
    let config = FileConfig::builder().sync(false).build();

    let write_file = FileHandle::open(temp.path().join("bench_write.db"), config.clone())
        .unwrap()
        .handle;
    let block = vec![0xA5u8; write_file.blocksize()];
    c.bench_function("alloc_write_block", |b| {
        b.iter(|| {
            let bid = write_file.alloc().unwrap();
            write_file.write_block(bid, &block).unwrap();
        })
    });

    let read_file = FileHandle::open(temp.path().join("bench_read.db"), config.clone())
        .unwrap()
        .handle;
    let (begin, end) = read_file.alloc_multiple(256).unwrap();
    for bid in begin..=end {
        read_file.write_block(bid, &block).unwrap();
    }
    let mut next = begin;
    c.bench_function("cached_read", |b| {
        b.iter(|| {
            let data = read_file.read(next).unwrap();
            next = if next == end { begin } else { next + 1 };
            data
        })
    });

    let commit_file = FileHandle::open(temp.path().join("bench_commit.db"), config)
        .unwrap()
        .handle;
    commit_file.update_header(b"bench-root").unwrap();
    c.bench_function("commit", |b| {
        b.iter(|| commit_file.commit().unwrap())
    });
}

criterion_group!(benches, filemgr_benchmarks);
criterion_main!(benches);
