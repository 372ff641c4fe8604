// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Segment file management
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Owns the open append segment (log + index file pair), decides when to roll
// and which closed segments a retention sweep may delete, and scans segment
// files during recovery.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{SyncMode, WalConfig};
use crate::entry::{
    decode_index_entry, encode_index_entry, WalRecord, INDEX_ENTRY_SIZE,
};
use crate::error::{WalError, WalResult};
use crate::segment::{index_path, log_path, SegmentDescriptor};
use crate::version::Version;

// ---------------------------------------------------------------------------
// ActiveSegment
// ---------------------------------------------------------------------------

/// The segment currently receiving appends.
#[derive(Debug)]
pub struct ActiveSegment {
    first_ver: Version,
    last_ver: Version,
    log_path: PathBuf,
    log_file: File,
    index_file: File,
    write_pos: u64,
    last_sync: Instant,
}

impl ActiveSegment {
    /// Create a fresh, empty segment starting at `first_ver`, truncating any
    /// stale files with the same name.
    pub fn create(wal_dir: &Path, first_ver: Version) -> WalResult<Self> {
        let log_path = log_path(wal_dir, first_ver);
        let log_file = open_rw(&log_path, true)?;
        let index_file = open_rw(&index_path(wal_dir, first_ver), true)?;

        debug!(first_ver, path = %log_path.display(), "Created WAL segment");

        Ok(Self {
            first_ver,
            last_ver: first_ver - 1,
            log_path,
            log_file,
            index_file,
            write_pos: 0,
            last_sync: Instant::now(),
        })
    }

    /// Reopen an existing segment for appends, positioned after its last
    /// valid frame.
    pub fn open(wal_dir: &Path, segment: &SegmentDescriptor) -> WalResult<Self> {
        let log_path = log_path(wal_dir, segment.first_ver);
        let log_file = open_rw(&log_path, false)?;
        let index_file = open_rw(&index_path(wal_dir, segment.first_ver), false)?;

        Ok(Self {
            first_ver: segment.first_ver,
            last_ver: segment.last_ver,
            log_path,
            log_file,
            index_file,
            write_pos: segment.file_size,
            last_sync: Instant::now(),
        })
    }

    /// First version of this segment.
    pub fn first_ver(&self) -> Version {
        self.first_ver
    }

    /// Last version appended to this segment.
    pub fn last_ver(&self) -> Version {
        self.last_ver
    }

    /// Bytes of valid frames written so far.
    pub fn file_size(&self) -> u64 {
        self.write_pos
    }

    /// Append an encoded frame for `version` plus its index entry. Returns
    /// the frame's offset.
    ///
    /// On failure the files are cut back to their previous length so no
    /// partial frame is left behind.
    pub fn append(&mut self, version: Version, frame: &[u8]) -> WalResult<u64> {
        let offset = self.write_pos;
        let slot = self.index_slot(version);

        if let Err(e) = self.write_frame(offset, slot, version, frame) {
            warn!(version, error = %e, "WAL append failed, discarding partial frame");
            if let Err(cut) = self.log_file.set_len(offset) {
                warn!(version, offset, error = %cut, "Failed to cut back WAL log file");
            }
            if let Err(cut) = self.index_file.set_len(slot) {
                warn!(version, slot, error = %cut, "Failed to cut back WAL index file");
            }
            return Err(e);
        }

        self.write_pos = offset + frame.len() as u64;
        self.last_ver = version;
        Ok(offset)
    }

    fn write_frame(&mut self, offset: u64, slot: u64, version: Version, frame: &[u8]) -> WalResult<()> {
        self.log_file.seek(SeekFrom::Start(offset))?;
        self.log_file.write_all(frame)?;
        self.index_file.seek(SeekFrom::Start(slot))?;
        self.index_file.write_all(&encode_index_entry(version, offset))?;
        Ok(())
    }

    /// Force an `fsync` of both files regardless of the sync mode.
    pub fn sync(&mut self) -> WalResult<()> {
        self.log_file.sync_data()?;
        self.index_file.sync_data()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Conditionally call fsync based on the configured sync mode.
    pub fn maybe_sync(&mut self, sync_mode: &SyncMode) -> WalResult<()> {
        match sync_mode {
            SyncMode::Fsync => self.sync()?,
            SyncMode::Periodic(interval) => {
                if self.last_sync.elapsed() >= *interval {
                    self.sync()?;
                }
            }
            SyncMode::Async => {
                // No-op: rely on OS page cache.
            }
        }
        Ok(())
    }

    /// Physically drop `ver` and every later record from this segment.
    /// Returns the new log file size.
    pub fn truncate_from(&mut self, ver: Version) -> WalResult<u64> {
        let offset = self.truncation_offset(ver)?;
        self.truncate_to(ver, offset)
    }

    /// Log offset at which `ver` starts, checked against the index.
    ///
    /// Reads only; nothing is modified, so a rollback can resolve its cut
    /// point before it deletes anything.
    pub fn truncation_offset(&mut self, ver: Version) -> WalResult<u64> {
        if ver > self.last_ver {
            return Ok(self.write_pos);
        }
        if ver <= self.first_ver {
            return Ok(0);
        }
        let slot = self.index_slot(ver);
        let (indexed, offset) = self.read_index_entry(slot).map_err(|e| match e {
            WalError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => WalError::CorruptRecord {
                segment: self.segment_name(),
                offset: slot,
                reason: format!("index has no entry for version {ver}"),
            },
            other => other,
        })?;
        if indexed != ver || offset > self.write_pos {
            return Err(WalError::CorruptRecord {
                segment: self.segment_name(),
                offset,
                reason: format!("index slot for version {ver} holds version {indexed} at {offset}"),
            });
        }
        Ok(offset)
    }

    /// Cut the segment so `ver` becomes the next version to append, with
    /// `offset` from [`ActiveSegment::truncation_offset`].
    pub fn truncate_to(&mut self, ver: Version, offset: u64) -> WalResult<u64> {
        if ver > self.last_ver {
            return Ok(self.write_pos);
        }
        let slot = self.index_slot(ver);
        self.index_file.set_len(slot)?;
        self.log_file.set_len(offset)?;
        self.sync()?;

        debug!(
            segment = %self.segment_name(),
            from_version = ver,
            new_size = offset,
            "Truncated WAL segment"
        );

        self.write_pos = offset;
        self.last_ver = ver - 1;
        Ok(offset)
    }

    fn read_index_entry(&mut self, slot: u64) -> WalResult<(Version, u64)> {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE as usize];
        self.index_file.seek(SeekFrom::Start(slot))?;
        self.index_file.read_exact(&mut bytes)?;
        Ok(decode_index_entry(&bytes))
    }

    fn index_slot(&self, ver: Version) -> u64 {
        (ver - self.first_ver).max(0) as u64 * INDEX_ENTRY_SIZE
    }

    fn segment_name(&self) -> String {
        file_name(&self.log_path)
    }
}

fn open_rw(path: &Path, truncate: bool) -> WalResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(truncate)
        .truncate(truncate)
        .open(path)?;
    Ok(file)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

// ---------------------------------------------------------------------------
// Roll and retention policy
// ---------------------------------------------------------------------------

/// Why the active segment is being rolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollReason {
    /// The next frame would push the segment past `seg_size`.
    Size,
    /// The segment has been open longer than `roll_period_secs`.
    Time,
    /// An explicit `roll()` call.
    Manual,
}

/// Decide whether the active segment must roll before a frame of
/// `frame_len` bytes is appended at time `now_ms`.
///
/// An empty segment never rolls, so an oversized record still lands
/// somewhere.
pub fn roll_reason(
    active: &SegmentDescriptor,
    frame_len: u64,
    config: &WalConfig,
    now_ms: i64,
) -> Option<RollReason> {
    if active.is_empty() {
        return None;
    }
    if let Some(limit) = config.segment_size_limit() {
        if active.file_size + frame_len > limit {
            return Some(RollReason::Size);
        }
    }
    if let Some(period) = config.roll_period_ms() {
        if now_ms - active.create_ts > period {
            return Some(RollReason::Time);
        }
    }
    None
}

/// How many of the oldest `segments` a retention sweep below `floor` may
/// delete.
///
/// Only closed segments whose every record is below `floor` are candidates.
/// The sweep stops at the first candidate kept by the retention period or
/// needed to stay above the retained byte floor.
pub fn retention_cut(
    segments: &[SegmentDescriptor],
    floor: Version,
    config: &WalConfig,
    now_ms: i64,
) -> usize {
    let mut remaining: u64 = segments.iter().map(|s| s.file_size).sum();
    let mut cut = 0;

    for segment in segments {
        if segment.is_open() || segment.last_ver >= floor {
            break;
        }
        if let Some(period) = config.retention_period_ms() {
            if now_ms - segment.close_ts < period {
                break;
            }
        }
        if let Some(limit) = config.retention_size_limit() {
            if remaining - segment.file_size < limit {
                break;
            }
        }
        remaining -= segment.file_size;
        cut += 1;
    }

    cut
}

// ---------------------------------------------------------------------------
// Recovery scanning
// ---------------------------------------------------------------------------

/// Result of scanning one segment log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentScan {
    /// Last version found; `first_ver - 1` if the segment holds none.
    pub last_ver: Version,
    /// Byte length of the valid frame prefix.
    pub valid_len: u64,
    /// Offset of each valid frame, in version order.
    pub offsets: Vec<u64>,
    /// Bytes past `valid_len` (a torn or corrupt tail).
    pub torn_bytes: u64,
}

/// Read every valid frame of a segment starting at `first_ver`.
///
/// Scanning stops at the first frame that is truncated, fails its CRC or
/// breaks version continuity; everything from there on is reported as a
/// torn tail.
pub fn scan_segment(path: &Path, first_ver: Version) -> WalResult<SegmentScan> {
    let data = fs::read(path)?;
    let mut record = WalRecord::default();
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    let mut expected = first_ver;

    while offset < data.len() {
        match record.decode_from(&data[offset..]) {
            Ok(consumed) if record.version == expected => {
                offsets.push(offset as u64);
                offset += consumed;
                expected += 1;
            }
            Ok(_) => {
                warn!(
                    offset,
                    expected,
                    found = record.version,
                    segment = %file_name(path),
                    "Version discontinuity in WAL segment, treating rest as torn"
                );
                break;
            }
            Err(e) => {
                debug!(
                    offset,
                    error = %e,
                    segment = %file_name(path),
                    "Stopped WAL segment scan"
                );
                break;
            }
        }
    }

    Ok(SegmentScan {
        last_ver: expected - 1,
        valid_len: offset as u64,
        offsets,
        torn_bytes: (data.len() - offset) as u64,
    })
}

/// Cut a segment's log file back to its valid prefix and rewrite its index
/// from the scanned offsets.
pub fn repair_segment(wal_dir: &Path, first_ver: Version, scan: &SegmentScan) -> WalResult<()> {
    let log = OpenOptions::new().write(true).open(log_path(wal_dir, first_ver))?;
    if scan.torn_bytes > 0 {
        warn!(
            first_ver,
            torn_bytes = scan.torn_bytes,
            valid_len = scan.valid_len,
            "Truncating torn tail of WAL segment"
        );
        log.set_len(scan.valid_len)?;
        log.sync_all()?;
    }

    let mut index = Vec::with_capacity(scan.offsets.len() * INDEX_ENTRY_SIZE as usize);
    for (i, offset) in scan.offsets.iter().enumerate() {
        index.extend_from_slice(&encode_index_entry(first_ver + i as Version, *offset));
    }
    let mut index_file = File::create(index_path(wal_dir, first_ver))?;
    index_file.write_all(&index)?;
    index_file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::encode_frame;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_records(segment: &mut ActiveSegment, versions: std::ops::Range<Version>) {
        for ver in versions {
            let frame = encode_frame(ver, 1, format!("payload-{ver}").as_bytes());
            segment.append(ver, &frame).unwrap();
        }
    }

    fn descriptor(first: Version, last: Version, close_ts: i64, size: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            first_ver: first,
            last_ver: last,
            create_ts: 0,
            close_ts,
            file_size: size,
        }
    }

    #[test]
    fn test_append_and_scan() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0).unwrap();
        write_records(&mut segment, 0..5);
        segment.sync().unwrap();

        let scan = scan_segment(&log_path(dir.path(), 0), 0).unwrap();
        assert_eq!(scan.last_ver, 4);
        assert_eq!(scan.offsets.len(), 5);
        assert_eq!(scan.valid_len, segment.file_size());
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 10).unwrap();
        write_records(&mut segment, 10..13);
        let valid = segment.file_size();
        drop(segment);

        let mut file = OpenOptions::new()
            .append(true)
            .open(log_path(dir.path(), 10))
            .unwrap();
        let frame = encode_frame(13, 1, b"half-written");
        file.write_all(&frame[..frame.len() / 2]).unwrap();

        let scan = scan_segment(&log_path(dir.path(), 10), 10).unwrap();
        assert_eq!(scan.last_ver, 12);
        assert_eq!(scan.valid_len, valid);
        assert!(scan.torn_bytes > 0);

        repair_segment(dir.path(), 10, &scan).unwrap();
        let len = fs::metadata(log_path(dir.path(), 10)).unwrap().len();
        assert_eq!(len, valid);
        let index_len = fs::metadata(index_path(dir.path(), 10)).unwrap().len();
        assert_eq!(index_len, 3 * INDEX_ENTRY_SIZE);
    }

    #[test]
    fn test_truncate_from_middle() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0).unwrap();
        write_records(&mut segment, 0..10);

        let size = segment.truncate_from(5).unwrap();
        assert_eq!(segment.last_ver(), 4);
        assert_eq!(segment.file_size(), size);

        let scan = scan_segment(&log_path(dir.path(), 0), 0).unwrap();
        assert_eq!(scan.last_ver, 4);
        assert_eq!(scan.valid_len, size);

        // Appends continue right after the truncation point.
        write_records(&mut segment, 5..7);
        let scan = scan_segment(&log_path(dir.path(), 0), 0).unwrap();
        assert_eq!(scan.last_ver, 6);
    }

    #[test]
    fn test_truncate_to_empty() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 20).unwrap();
        write_records(&mut segment, 20..25);

        assert_eq!(segment.truncate_from(20).unwrap(), 0);
        assert_eq!(segment.last_ver(), 19);
        assert_eq!(fs::metadata(index_path(dir.path(), 20)).unwrap().len(), 0);
    }

    #[test]
    fn test_truncation_offset_rejects_damaged_index() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0).unwrap();
        write_records(&mut segment, 0..5);
        let size = segment.file_size();

        let mut index = OpenOptions::new()
            .write(true)
            .open(index_path(dir.path(), 0))
            .unwrap();
        index.seek(SeekFrom::Start(3 * INDEX_ENTRY_SIZE)).unwrap();
        index.write_all(&encode_index_entry(42, 7)).unwrap();
        drop(index);

        assert!(matches!(
            segment.truncation_offset(3),
            Err(WalError::CorruptRecord { .. })
        ));
        assert_eq!(segment.last_ver(), 4);
        assert_eq!(fs::metadata(log_path(dir.path(), 0)).unwrap().len(), size);

        // Slots that are intact still resolve.
        let offset = segment.truncation_offset(2).unwrap();
        assert_eq!(segment.truncate_to(2, offset).unwrap(), offset);
        assert_eq!(segment.last_ver(), 1);
    }

    #[test]
    fn test_reopen_continues_at_file_size() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0).unwrap();
        write_records(&mut segment, 0..3);
        let descriptor = SegmentDescriptor {
            first_ver: 0,
            last_ver: 2,
            create_ts: 0,
            close_ts: -1,
            file_size: segment.file_size(),
        };
        drop(segment);

        let mut reopened = ActiveSegment::open(dir.path(), &descriptor).unwrap();
        write_records(&mut reopened, 3..5);
        let scan = scan_segment(&log_path(dir.path(), 0), 0).unwrap();
        assert_eq!(scan.last_ver, 4);
    }

    #[test]
    fn test_roll_reason_size_and_time() {
        let config = WalConfig::default().with_seg_size(100).with_roll_period(10);
        let mut active = SegmentDescriptor::new(0, 1_000);
        assert_eq!(roll_reason(&active, 500, &config, 1_000_000), None);

        active.last_ver = 3;
        active.file_size = 80;
        assert_eq!(roll_reason(&active, 30, &config, 1_000), Some(RollReason::Size));
        assert_eq!(roll_reason(&active, 10, &config, 1_000), None);
        assert_eq!(roll_reason(&active, 10, &config, 11_001), Some(RollReason::Time));
    }

    #[test]
    fn test_roll_reason_disabled_by_default() {
        let mut active = SegmentDescriptor::new(0, 0);
        active.last_ver = 100;
        active.file_size = u64::MAX / 2;
        assert_eq!(roll_reason(&active, 1 << 30, &WalConfig::default(), i64::MAX / 2), None);
    }

    #[test]
    fn test_retention_cut_snapshot_floor() {
        let segments = vec![
            descriptor(0, 9, 100, 10),
            descriptor(10, 19, 200, 10),
            descriptor(20, 29, -1, 10),
        ];
        let config = WalConfig::default();
        assert_eq!(retention_cut(&segments, 15, &config, 1_000), 1);
        assert_eq!(retention_cut(&segments, 20, &config, 1_000), 2);
        // The open segment is never a candidate.
        assert_eq!(retention_cut(&segments, 100, &config, 1_000), 2);
        assert_eq!(retention_cut(&segments, 5, &config, 1_000), 0);
    }

    #[test]
    fn test_retention_cut_period_and_size() {
        let segments = vec![
            descriptor(0, 9, 1_000, 10),
            descriptor(10, 19, 50_000, 10),
            descriptor(20, 29, -1, 10),
        ];

        let by_period = WalConfig::default().with_retention(30, 0);
        assert_eq!(retention_cut(&segments, 20, &by_period, 40_000), 1);
        assert_eq!(retention_cut(&segments, 20, &by_period, 90_000), 2);

        let by_size = WalConfig::default().with_retention(0, 15);
        assert_eq!(retention_cut(&segments, 20, &by_size, 0), 1);
    }

    #[test]
    fn test_periodic_sync_mode() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0).unwrap();
        write_records(&mut segment, 0..2);
        segment
            .maybe_sync(&SyncMode::Periodic(Duration::from_millis(0)))
            .unwrap();
        segment.maybe_sync(&SyncMode::Async).unwrap();
    }
}
