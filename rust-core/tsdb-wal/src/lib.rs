// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log (WAL) crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The durability layer of a time-series node: every write is appended to the
// log under a strictly increasing version before it is applied to the
// in-memory and on-disk stores. Callers commit versions once applied, roll
// back uncommitted tails, and take snapshots that let old segments be
// deleted.
//
// # Architecture
//
// A log is a directory holding a sequence of **segments** plus a metadata
// side-car file:
//
// ```text
// 00000000000000000000.log   record frames for versions 0..=N
// 00000000000000000000.idx   16-byte (version, offset) entries, one per record
// 0000000000000000000N+1.log ...
// meta.json                  version cursors + segment descriptors
// ```
//
// Segments roll by size or age, checked on each append. Completing a
// snapshot makes every closed segment wholly below it eligible for deletion,
// subject to the retention period and retained-size knobs. On reopen the
// metadata is reconciled against the segment files and the tail of the
// newest segment is re-scanned, so a crash mid-append loses at most the torn
// record.
//
// ## On-disk record format (all integers little-endian)
//
// ```text
// [4 bytes: frame_length (u32)]   -- length of everything after this field
// [4 bytes: crc32 checksum]       -- CRC32 of all bytes after this field
// [8 bytes: version (i64)]
// [1 byte:  record_type]
// [4 bytes: payload_len (u32)]
// [N bytes: payload]
// ```
//
// ## Usage
//
// ```no_run
// use tsdb_wal::{Wal, WalConfig};
//
// let wal = Wal::open("/tmp/tsdb-wal", WalConfig::default().with_seg_size(64 << 20)).unwrap();
//
// wal.append(0, 1, b"cpu,host=a value=0.5").unwrap();
// wal.append(1, 1, b"cpu,host=a value=0.7").unwrap();
// wal.commit(1).unwrap();
//
// let mut handle = wal.open_read_handle().unwrap();
// let record = handle.read_at(0).unwrap();
// println!("version={} type={}", record.version, record.record_type);
//
// wal.begin_snapshot(1).unwrap();
// wal.end_snapshot().unwrap();
// wal.close().unwrap();
// ```

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod meta;
pub mod reader;
pub mod registry;
pub mod segment;
pub mod segment_file;
pub mod version;
pub mod wal;

// Re-export the primary public API for ergonomic imports.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncMode, WalConfig};
pub use entry::{WalRecord, MAX_RECORD_SIZE};
pub use error::{WalError, WalResult};
pub use reader::ReadHandle;
pub use registry::WalRegistry;
pub use segment::SegmentDescriptor;
pub use version::{Version, VersionState, NO_VERSION};
pub use wal::Wal;
