// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Read handles
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `ReadHandle` is a cursor for random-access replay by version. Each handle
// owns its own file descriptors and decode buffer, so independent handles
// never contend with each other. File I/O runs without any log lock held.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use crate::entry::{decode_index_entry, peek_frame_len, WalRecord, INDEX_ENTRY_SIZE, LENGTH_PREFIX_SIZE};
use crate::error::{WalError, WalResult};
use crate::segment::{index_path, log_filename, log_path, SegmentDescriptor};
use crate::version::Version;
use crate::wal::Wal;

/// File handles of the segment a handle read from last.
#[derive(Debug)]
struct CachedSegment {
    first_ver: Version,
    epoch: u64,
    name: String,
    log: File,
    index: File,
}

impl CachedSegment {
    fn open(wal_dir: &Path, first_ver: Version, epoch: u64) -> std::io::Result<Self> {
        Ok(Self {
            first_ver,
            epoch,
            name: log_filename(first_ver),
            log: File::open(log_path(wal_dir, first_ver))?,
            index: File::open(index_path(wal_dir, first_ver))?,
        })
    }

    fn corrupt(&self, offset: u64, reason: impl Into<String>) -> WalError {
        WalError::CorruptRecord {
            segment: self.name.clone(),
            offset,
            reason: reason.into(),
        }
    }

    /// Decode the record for `ver` into `record`, using `frame` as scratch.
    fn read_record(&mut self, ver: Version, frame: &mut Vec<u8>, record: &mut WalRecord) -> WalResult<()> {
        let slot = (ver - self.first_ver) as u64 * INDEX_ENTRY_SIZE;
        let mut entry = [0u8; INDEX_ENTRY_SIZE as usize];
        self.index.seek(SeekFrom::Start(slot))?;
        if let Err(e) = self.index.read_exact(&mut entry) {
            return Err(match e.kind() {
                ErrorKind::UnexpectedEof => self.corrupt(slot, format!("index has no entry for version {ver}")),
                _ => e.into(),
            });
        }

        let (indexed, offset) = decode_index_entry(&entry);
        if indexed != ver {
            return Err(self.corrupt(offset, format!("index slot for version {ver} holds version {indexed}")));
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.log.seek(SeekFrom::Start(offset))?;
        self.read_frame_bytes(offset, &mut prefix)?;
        let total = peek_frame_len(prefix).map_err(|e| self.corrupt(offset, e.to_string()))?;

        frame.clear();
        frame.resize(total, 0);
        frame[..LENGTH_PREFIX_SIZE].copy_from_slice(&prefix);
        self.read_frame_bytes(offset, &mut frame[LENGTH_PREFIX_SIZE..])?;

        record
            .decode_from(frame)
            .map_err(|e| self.corrupt(offset, e.to_string()))?;
        if record.version != ver {
            return Err(self.corrupt(
                offset,
                format!("frame holds version {} instead of {ver}", record.version),
            ));
        }
        Ok(())
    }

    fn read_frame_bytes(&mut self, offset: u64, buf: &mut [u8]) -> WalResult<()> {
        match self.log.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(self.corrupt(offset, "frame extends past end of segment"))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Where a version lives, as seen under one look at the log state.
#[derive(Debug, Clone, Copy)]
struct Located {
    segment: Version,
    epoch: u64,
    first: Version,
    last: Version,
}

/// A cursor over one log for replay by version.
///
/// The record returned by [`ReadHandle::read_at`] borrows the handle's
/// buffer, which is reused by the next read.
#[derive(Debug)]
pub struct ReadHandle {
    wal: Arc<Wal>,
    position: Version,
    record: WalRecord,
    frame: Vec<u8>,
    cached: Option<CachedSegment>,
}

impl ReadHandle {
    pub(crate) fn new(wal: Arc<Wal>, position: Version) -> Self {
        Self {
            wal,
            position,
            record: WalRecord::default(),
            frame: Vec::new(),
            cached: None,
        }
    }

    /// The version the next [`ReadHandle::read_next`] will read.
    pub fn position(&self) -> Version {
        self.position
    }

    /// Move the cursor without reading.
    pub fn seek(&mut self, ver: Version) {
        self.position = ver;
    }

    /// The record decoded by the last successful read.
    pub fn record(&self) -> &WalRecord {
        &self.record
    }

    /// Read the record at the current position.
    pub fn read_next(&mut self) -> WalResult<&WalRecord> {
        self.read_at(self.position)
    }

    /// Read the record with version `ver` and move the cursor to `ver + 1`.
    ///
    /// Fails with [`WalError::VersionNotFound`] unless
    /// `first_ver <= ver <= last_ver`, and with [`WalError::CorruptRecord`]
    /// if the stored frame fails its checksum or holds another version.
    ///
    /// The log state is only locked to resolve `ver` and to re-check the
    /// layout epoch afterwards. A rollback or retention sweep that lands in
    /// between makes the read start over.
    pub fn read_at(&mut self, ver: Version) -> WalResult<&WalRecord> {
        loop {
            let located = self.locate(ver)?;
            let read = self.read_located(ver, &located);
            if !self.still_current(&located)? {
                self.cached = None;
                continue;
            }
            read?;
            self.position = ver + 1;
            return Ok(&self.record);
        }
    }

    /// Resolve `ver` to its segment under the state read guard.
    fn locate(&self, ver: Version) -> WalResult<Located> {
        let state = self.wal.read_state()?;
        state.ensure_open()?;

        let versions = &state.versions;
        let not_found = || WalError::VersionNotFound {
            version: ver,
            first: versions.first_ver,
            last: versions.last_ver,
        };
        if versions.is_empty() || ver < versions.first_ver || ver > versions.last_ver {
            return Err(not_found());
        }
        let segment: &SegmentDescriptor = state
            .segments
            .find(ver)
            .and_then(|index| state.segments.get(index))
            .ok_or_else(not_found)?;

        Ok(Located {
            segment: segment.first_ver,
            epoch: state.epoch,
            first: versions.first_ver,
            last: versions.last_ver,
        })
    }

    /// Decode `ver` from the located segment without holding any lock.
    ///
    /// `last_ver` is published only after a frame is fully written, so a
    /// located version is never half-written.
    fn read_located(&mut self, ver: Version, located: &Located) -> WalResult<()> {
        let stale = self
            .cached
            .as_ref()
            .map_or(true, |c| c.first_ver != located.segment || c.epoch != located.epoch);
        if stale {
            self.cached = None;
            let opened = CachedSegment::open(self.wal.dir(), located.segment, located.epoch)
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => WalError::VersionNotFound {
                        version: ver,
                        first: located.first,
                        last: located.last,
                    },
                    _ => e.into(),
                })?;
            self.cached = Some(opened);
        }
        match self.cached.as_mut() {
            Some(cached) => cached.read_record(ver, &mut self.frame, &mut self.record),
            None => Err(WalError::VersionNotFound {
                version: ver,
                first: located.first,
                last: located.last,
            }),
        }
    }

    /// Returns `false` if files were truncated or deleted since `located`.
    fn still_current(&self, located: &Located) -> WalResult<bool> {
        Ok(self.wal.read_state()?.epoch == located.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn payload(ver: Version) -> Vec<u8> {
        format!("tvapq02tcp-{ver}").into_bytes()
    }

    fn filled_wal(dir: &Path, count: Version, seg_size: i64) -> Arc<Wal> {
        let wal = Wal::open(dir, WalConfig::default().with_seg_size(seg_size)).unwrap();
        for ver in 0..count {
            wal.append(ver, (ver % 4) as u8, &payload(ver)).unwrap();
        }
        wal
    }

    #[test]
    fn test_read_at_sets_position() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 10, -1);
        let mut handle = wal.open_read_handle().unwrap();
        assert_eq!(handle.position(), 0);

        let record = handle.read_at(7).unwrap();
        assert_eq!(record.version, 7);
        assert_eq!(record.record_type, 3);
        assert_eq!(record.payload, payload(7));
        assert_eq!(handle.position(), 8);
    }

    #[test]
    fn test_read_next_walks_segments() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 30, 120);
        assert!(wal.segments().unwrap().len() > 3);

        let mut handle = wal.open_read_handle().unwrap();
        for ver in 0..30 {
            assert_eq!(handle.read_next().unwrap().payload, payload(ver));
        }
        assert!(matches!(
            handle.read_next(),
            Err(WalError::VersionNotFound { version: 30, first: 0, last: 29 })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), WalConfig::default()).unwrap();
        let mut handle = wal.open_read_handle().unwrap();
        assert!(matches!(handle.read_at(0), Err(WalError::VersionNotFound { .. })));

        wal.append(0, 0, b"only").unwrap();
        assert_eq!(handle.read_at(0).unwrap().payload, b"only");
        assert!(matches!(handle.read_at(-1), Err(WalError::VersionNotFound { .. })));
        assert!(matches!(handle.read_at(1), Err(WalError::VersionNotFound { .. })));
    }

    #[test]
    fn test_read_after_rollback_and_rewrite() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 20, 120);
        let mut handle = wal.open_read_handle().unwrap();
        assert_eq!(handle.read_at(15).unwrap().payload, payload(15));

        wal.rollback(4).unwrap();
        assert!(matches!(handle.read_at(15), Err(WalError::VersionNotFound { .. })));

        for ver in 4..20 {
            wal.append(ver, 0, format!("rewritten-{ver}").as_bytes()).unwrap();
        }
        assert_eq!(handle.read_at(15).unwrap().payload, b"rewritten-15");
        assert_eq!(handle.read_at(3).unwrap().payload, payload(3));
    }

    #[test]
    fn test_corrupt_frame_detected() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 3, -1);

        // Flip the last payload byte of the last record in place.
        let path = log_path(dir.path(), 0);
        let len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let mut handle = wal.open_read_handle().unwrap();
        assert_eq!(handle.read_at(0).unwrap().version, 0);
        assert!(matches!(handle.read_at(2), Err(WalError::CorruptRecord { .. })));
    }

    #[test]
    fn test_seek_and_record() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 5, -1);
        let mut handle = wal.open_read_handle().unwrap();
        handle.seek(3);
        handle.read_next().unwrap();
        assert_eq!(handle.record().version, 3);
        assert_eq!(handle.position(), 4);
    }

    #[test]
    fn test_closed_log_rejects_reads() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 2, -1);
        let mut handle = wal.open_read_handle().unwrap();
        wal.close().unwrap();
        assert!(matches!(handle.read_at(0), Err(WalError::Closed)));
    }

    #[test]
    fn test_append_completes_while_read_is_in_flight() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 10, -1);
        let mut handle = wal.open_read_handle().unwrap();

        // Resolved but not yet decoded.
        let located = handle.locate(4).unwrap();

        let (done, appended) = mpsc::channel();
        let writer = Arc::clone(&wal);
        let append = thread::spawn(move || {
            let result = writer.append(10, 0, &payload(10));
            let _ = done.send(());
            result
        });
        assert!(appended.recv_timeout(Duration::from_secs(5)).is_ok());
        append.join().unwrap().unwrap();

        handle.read_located(4, &located).unwrap();
        assert!(handle.still_current(&located).unwrap());
        assert_eq!(handle.record().payload, payload(4));
        assert_eq!(handle.read_at(10).unwrap().payload, payload(10));
    }

    #[test]
    fn test_rollback_during_read_forces_retry() {
        let dir = TempDir::new().unwrap();
        let wal = filled_wal(dir.path(), 20, 120);
        let mut handle = wal.open_read_handle().unwrap();

        let located = handle.locate(15).unwrap();
        wal.rollback(12).unwrap();
        let _ = handle.read_located(15, &located);
        assert!(!handle.still_current(&located).unwrap());

        assert!(matches!(
            handle.read_at(15),
            Err(WalError::VersionNotFound { version: 15, last: 11, .. })
        ));
    }
}
