// SPDX-License-Identifier: PMPL-1.0-or-later
//! Performance benchmarks for the TSDB write-ahead log

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::PathBuf;

use tsdb_wal::{SyncMode, Version, Wal, WalConfig};

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bench-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Append Benchmarks
// ============================================================================

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for size in [64usize, 1024, 16 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("async", size), &data, |b, data| {
            let dir = scratch_dir("append");
            let config = WalConfig::default()
                .with_seg_size(64 << 20)
                .with_sync_mode(SyncMode::Async);
            let wal = Wal::open(&dir, config).unwrap();
            let mut next: Version = 0;
            b.iter(|| {
                wal.append(next, 1, black_box(data)).unwrap();
                next += 1;
            });
            wal.close().unwrap();
            std::fs::remove_dir_all(&dir).ok();
        });
    }

    group.finish();
}

fn bench_append_fsync(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_fsync");
    group.sample_size(20);

    let data = payload(256);
    group.bench_function("fsync_256", |b| {
        let dir = scratch_dir("fsync");
        let wal = Wal::open(&dir, WalConfig::default()).unwrap();
        let mut next: Version = 0;
        b.iter(|| {
            wal.append(next, 1, black_box(&data)).unwrap();
            next += 1;
        });
        wal.close().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    });

    group.finish();
}

// ============================================================================
// Read Benchmarks
// ============================================================================

fn bench_random_read(c: &mut Criterion) {
    let dir = scratch_dir("read");
    let config = WalConfig::default()
        .with_seg_size(1 << 20)
        .with_sync_mode(SyncMode::Async);
    let wal = Wal::open(&dir, config).unwrap();
    let count: Version = 100_000;
    let data = payload(128);
    for ver in 0..count {
        wal.append(ver, 1, &data).unwrap();
    }

    let mut group = c.benchmark_group("read");
    group.bench_function("random_read_at", |b| {
        let mut handle = wal.open_read_handle().unwrap();
        let mut ver: Version = 0;
        b.iter(|| {
            ver = (ver + 7919) % count;
            black_box(handle.read_at(ver).unwrap().payload.len())
        });
    });
    group.bench_function("sequential_read_next", |b| {
        let mut handle = wal.open_read_handle().unwrap();
        b.iter(|| {
            if handle.position() >= count {
                handle.seek(0);
            }
            black_box(handle.read_next().unwrap().version)
        });
    });
    group.finish();

    wal.close().unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Lifecycle Benchmarks
// ============================================================================

fn bench_recovery(c: &mut Criterion) {
    let dir = scratch_dir("recover");
    let config = WalConfig::default()
        .with_seg_size(256 << 10)
        .with_sync_mode(SyncMode::Async);
    let wal = Wal::open(&dir, config.clone()).unwrap();
    let data = payload(128);
    for ver in 0..50_000 {
        wal.append(ver, 1, &data).unwrap();
    }
    wal.close().unwrap();
    drop(wal);

    c.bench_function("reopen_50k_records", |b| {
        b.iter(|| {
            let wal = Wal::open(&dir, config.clone()).unwrap();
            black_box(wal.last_ver().unwrap());
            wal.close().unwrap();
        });
    });

    std::fs::remove_dir_all(&dir).ok();
}

criterion_group!(appends, bench_append, bench_append_fsync);
criterion_group!(reads, bench_random_read);
criterion_group!(lifecycle, bench_recovery);
criterion_main!(appends, reads, lifecycle);
