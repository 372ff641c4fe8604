// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Log engine
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `Wal` ties the version state, the segment registry and the open segment
// together behind three locks:
//
//   writer  Mutex<WriterState>          serializes every mutating call
//   state   RwLock<LogState>            cursors + registry, read by handles
//   active  Mutex<Option<ActiveSegment>> bytes of the open segment
//
// Locks are always taken in that order. The append path releases `active`
// before it takes `state`. Read handles only take `state` briefly, to resolve
// a version and to re-check the layout epoch after their file I/O.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::WalConfig;
use crate::entry::{encode_frame, MAX_RECORD_SIZE};
use crate::error::{WalError, WalResult};
use crate::meta::{self, Recovered};
use crate::reader::ReadHandle;
use crate::segment::{log_path, remove_segment_files, SegmentDescriptor, SegmentRegistry, OPEN_TS};
use crate::segment_file::{retention_cut, roll_reason, ActiveSegment, RollReason};
use crate::version::{Version, VersionState};

#[derive(Debug)]
struct WriterState {
    config: WalConfig,
}

/// Cursors and segment layout shared with read handles.
#[derive(Debug)]
pub(crate) struct LogState {
    pub(crate) versions: VersionState,
    pub(crate) segments: SegmentRegistry,
    /// Bumped whenever segment files are truncated or deleted.
    pub(crate) epoch: u64,
    pub(crate) closed: bool,
}

impl LogState {
    pub(crate) fn ensure_open(&self) -> WalResult<()> {
        if self.closed {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    fn open_segment(&self) -> WalResult<&SegmentDescriptor> {
        self.segments
            .last()
            .ok_or_else(|| WalError::CorruptMetadata("log has no segments".to_string()))
    }

    /// Drop the segments a retention sweep below `floor` may delete.
    fn apply_retention(
        &mut self,
        floor: Version,
        config: &WalConfig,
        now_ms: i64,
    ) -> Vec<SegmentDescriptor> {
        let cut = retention_cut(self.segments.as_slice(), floor, config, now_ms);
        if cut == 0 {
            return Vec::new();
        }
        let removed = self.segments.remove_front(cut);
        if let Some(first) = self.segments.first() {
            self.versions.first_ver = first.first_ver;
        }
        self.epoch += 1;
        removed
    }
}

/// A versioned, segmented write-ahead log rooted at one directory.
///
/// A `Wal` is shared as `Arc<Wal>`: one logical writer stream and any number
/// of [`ReadHandle`]s may use it concurrently.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    writer: Mutex<WriterState>,
    state: RwLock<LogState>,
    active: Mutex<Option<ActiveSegment>>,
}

impl Wal {
    /// Open the log in `dir`, creating the directory and an empty log if
    /// needed, and recovering the persisted state otherwise.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> WalResult<Arc<Self>> {
        Self::open_with_clock(dir, config, Arc::new(SystemClock::new()))
    }

    /// Like [`Wal::open`], reading time from `clock`.
    pub fn open_with_clock(
        dir: impl AsRef<Path>,
        config: WalConfig,
        clock: Arc<dyn Clock>,
    ) -> WalResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!(dir = %dir.display(), "Created WAL directory");
        }

        let now = clock.now_ms();
        let (versions, segments, active) = match meta::recover(&dir, now)? {
            Some(Recovered { versions, segments }) => {
                let last = segments
                    .last()
                    .ok_or_else(|| WalError::CorruptMetadata("log has no segments".to_string()))?;
                let active = ActiveSegment::open(&dir, last)?;
                (versions, segments, active)
            }
            None => {
                let active = ActiveSegment::create(&dir, 0)?;
                let segments =
                    SegmentRegistry::from_descriptors(vec![SegmentDescriptor::new(0, now)]);
                info!(dir = %dir.display(), "Initialized fresh WAL");
                (VersionState::new(), segments, active)
            }
        };

        meta::write_meta(&dir, &meta::serialize_meta(&versions, &segments)?)?;

        info!(
            dir = %dir.display(),
            first_ver = versions.first_ver,
            last_ver = versions.last_ver,
            commit_ver = versions.commit_ver,
            snapshot_ver = versions.snapshot_ver,
            segments = segments.len(),
            "Opened WAL"
        );

        Ok(Arc::new(Self {
            dir,
            clock,
            writer: Mutex::new(WriterState { config }),
            state: RwLock::new(LogState {
                versions,
                segments,
                epoch: 0,
                closed: false,
            }),
            active: Mutex::new(Some(active)),
        }))
    }

    /// Directory holding this log's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open a new read handle positioned at the first retained version.
    pub fn open_read_handle(self: &Arc<Self>) -> WalResult<ReadHandle> {
        let start = {
            let state = self.read_state()?;
            state.ensure_open()?;
            state.versions.first_ver.max(0)
        };
        Ok(ReadHandle::new(Arc::clone(self), start))
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Append one record. `version` must be exactly `last_ver + 1`.
    ///
    /// If the active segment has reached its size or age limit it is rolled
    /// first, so a record never spans two segments. When the post-write sync
    /// fails the record stays in the log and its version is consumed; the
    /// error reports that its durability is unknown.
    pub fn append(&self, version: Version, record_type: u8, payload: &[u8]) -> WalResult<()> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                length: payload.len(),
                max_length: MAX_RECORD_SIZE,
            });
        }

        let writer = self.lock_writer()?;
        let open_segment = {
            let state = self.read_state()?;
            state.ensure_open()?;
            state.versions.check_append(version)?;
            state.open_segment()?.clone()
        };

        let now = self.clock.now_ms();
        let frame = encode_frame(version, record_type, payload);
        if let Some(reason) = roll_reason(&open_segment, frame.len() as u64, &writer.config, now) {
            self.roll_locked(reason, now)?;
        }

        let (file_size, synced) = {
            let mut active = self.lock_active()?;
            let segment = active.as_mut().ok_or(WalError::Closed)?;
            segment.append(version, &frame)?;
            let synced = segment.maybe_sync(&writer.config.sync_mode);
            (segment.file_size(), synced)
        };

        {
            let mut state = self.write_state()?;
            state.versions.record_append(version);
            if let Some(open) = state.segments.last_mut() {
                open.last_ver = version;
                open.file_size = file_size;
            }
        }

        debug!(version, record_type, bytes = frame.len(), "Appended WAL record");
        synced
    }

    /// Acknowledge every version up to and including `version` as applied.
    pub fn commit(&self, version: Version) -> WalResult<()> {
        let _writer = self.lock_writer()?;
        let mut state = self.write_state()?;
        state.ensure_open()?;
        state.versions.commit(version)?;
        debug!(version, "Committed WAL");
        Ok(())
    }

    /// Discard `version` and every later record.
    ///
    /// The segment holding `version` is truncated just before it and becomes
    /// the open segment again; later segments are deleted. The cut point is
    /// resolved before any file is touched, so a damaged index leaves the log
    /// as it was.
    pub fn rollback(&self, version: Version) -> WalResult<()> {
        let _writer = self.lock_writer()?;
        let mut state = self.write_state()?;
        state.ensure_open()?;
        state.versions.check_rollback(version)?;

        let index = state.segments.find(version).ok_or_else(|| {
            WalError::CorruptMetadata(format!("no segment holds version {version}"))
        })?;
        let target = state.segments.as_slice()[index].clone();
        let later: Vec<SegmentDescriptor> = state.segments.as_slice()[index + 1..].to_vec();

        let mut active = self.lock_active()?;
        let mut reopened = None;
        let offset = if target.is_open() {
            active.as_mut().ok_or(WalError::Closed)?.truncation_offset(version)?
        } else {
            let mut segment = ActiveSegment::open(&self.dir, &target)?;
            let offset = segment.truncation_offset(version)?;
            reopened = Some(segment);
            offset
        };

        // Newest first, so a crash leaves a contiguous prefix behind.
        for (i, segment) in later.iter().enumerate().rev() {
            if let Err(e) = remove_segment_files(&self.dir, segment.first_ver) {
                let position = index + 1 + i;
                let keep = if log_path(&self.dir, segment.first_ver).exists() {
                    position + 1
                } else {
                    position
                };
                if keep < state.segments.len() {
                    self.fence_failed_rollback(&mut state, &mut active, keep);
                }
                return Err(e);
            }
        }

        let truncated = match reopened.as_mut() {
            Some(segment) => segment.truncate_to(version, offset),
            None => active
                .as_mut()
                .ok_or(WalError::Closed)?
                .truncate_to(version, offset),
        };
        let new_size = match truncated {
            Ok(size) => size,
            Err(e) => {
                self.fence_failed_rollback(&mut state, &mut active, index + 1);
                return Err(e);
            }
        };
        if let Some(segment) = reopened {
            *active = Some(segment);
        }
        drop(active);

        let removed = state.segments.truncate_after(index);
        if let Some(open) = state.segments.last_mut() {
            open.last_ver = version - 1;
            open.file_size = new_size;
            open.close_ts = OPEN_TS;
        }
        state.versions.apply_rollback(version);
        state.epoch += 1;

        let bytes = meta::serialize_meta(&state.versions, &state.segments)?;
        drop(state);
        meta::write_meta(&self.dir, &bytes)?;

        info!(
            version,
            last_ver = version - 1,
            removed_segments = removed.len(),
            "Rolled back WAL"
        );
        Ok(())
    }

    /// Match the state to the files after a rollback failed part way and
    /// close the log. Only the first `keep` segments are still on disk.
    ///
    /// The tail may be partially truncated, so no further appends are
    /// accepted; reopening rescans and repairs it.
    fn fence_failed_rollback(
        &self,
        state: &mut LogState,
        active: &mut Option<ActiveSegment>,
        keep: usize,
    ) {
        state.segments.truncate_after(keep.saturating_sub(1));
        if let Some(tail) = state.segments.last_mut() {
            tail.close_ts = OPEN_TS;
        }
        if let Some(tail_last) = state.segments.last().map(|tail| tail.last_ver) {
            state.versions.apply_rollback(tail_last + 1);
        }
        state.epoch += 1;
        state.closed = true;
        *active = None;

        let persisted = meta::serialize_meta(&state.versions, &state.segments)
            .and_then(|bytes| meta::write_meta(&self.dir, &bytes));
        if let Err(e) = persisted {
            warn!(dir = %self.dir.display(), error = %e, "Failed to persist WAL metadata after failed rollback");
        }
        warn!(
            dir = %self.dir.display(),
            segments = state.segments.len(),
            "Rollback failed part way, WAL closed until reopened"
        );
    }

    /// Start a snapshot covering every version up to `version`.
    pub fn begin_snapshot(&self, version: Version) -> WalResult<()> {
        let _writer = self.lock_writer()?;
        let mut state = self.write_state()?;
        state.ensure_open()?;
        state.versions.begin_snapshot(version)?;
        info!(version, "Began WAL snapshot");
        Ok(())
    }

    /// Complete the in-flight snapshot and sweep segments it makes
    /// redundant.
    pub fn end_snapshot(&self) -> WalResult<()> {
        let writer = self.lock_writer()?;
        let now = self.clock.now_ms();

        let (snapshot_ver, first_ver, removed, bytes) = {
            let mut state = self.write_state()?;
            state.ensure_open()?;
            let snapshot_ver = state.versions.end_snapshot()?;
            let removed = state.apply_retention(snapshot_ver, &writer.config, now);
            let bytes = meta::serialize_meta(&state.versions, &state.segments)?;
            (snapshot_ver, state.versions.first_ver, removed, bytes)
        };

        meta::write_meta(&self.dir, &bytes)?;
        for segment in &removed {
            remove_segment_files(&self.dir, segment.first_ver)?;
        }

        info!(
            snapshot_ver,
            first_ver,
            removed_segments = removed.len(),
            "Completed WAL snapshot"
        );
        Ok(())
    }

    /// Delete closed segments whose records all lie below `version`.
    ///
    /// `version` is clamped to the snapshot version; retention knobs are not
    /// consulted. Returns the number of segments removed.
    pub fn remove_segments_before(&self, version: Version) -> WalResult<usize> {
        let _writer = self.lock_writer()?;
        let now = self.clock.now_ms();

        let (removed, bytes) = {
            let mut state = self.write_state()?;
            state.ensure_open()?;
            let floor = version.min(state.versions.snapshot_ver);
            let removed = state.apply_retention(floor, &WalConfig::default(), now);
            if removed.is_empty() {
                return Ok(0);
            }
            (removed, meta::serialize_meta(&state.versions, &state.segments)?)
        };

        meta::write_meta(&self.dir, &bytes)?;
        for segment in &removed {
            remove_segment_files(&self.dir, segment.first_ver)?;
        }
        info!(version, removed_segments = removed.len(), "Removed WAL segments");
        Ok(removed.len())
    }

    /// Close the open segment and start a new one. A no-op while the open
    /// segment holds no records. Returns the descriptor of the open segment.
    pub fn roll(&self) -> WalResult<SegmentDescriptor> {
        let _writer = self.lock_writer()?;
        self.read_state()?.ensure_open()?;
        let now = self.clock.now_ms();
        self.roll_locked(RollReason::Manual, now)
    }

    /// Roll with the write lock already held.
    fn roll_locked(&self, reason: RollReason, now_ms: i64) -> WalResult<SegmentDescriptor> {
        let (closing, next_first) = {
            let state = self.read_state()?;
            let open = state.open_segment()?;
            if open.is_empty() {
                return Ok(open.clone());
            }
            (open.first_ver, open.last_ver + 1)
        };

        {
            let mut active = self.lock_active()?;
            active.as_mut().ok_or(WalError::Closed)?.sync()?;
            *active = Some(ActiveSegment::create(&self.dir, next_first)?);
        }

        let (descriptor, bytes) = {
            let mut state = self.write_state()?;
            state.segments.close_last(now_ms);
            let descriptor = SegmentDescriptor::new(next_first, now_ms);
            state.segments.push(descriptor.clone());
            (descriptor, meta::serialize_meta(&state.versions, &state.segments)?)
        };
        meta::write_meta(&self.dir, &bytes)?;

        info!(
            reason = ?reason,
            closed_first_ver = closing,
            first_ver = next_first,
            "Rolled WAL segment"
        );
        Ok(descriptor)
    }

    // -----------------------------------------------------------------------
    // Durability and lifecycle
    // -----------------------------------------------------------------------

    /// Force an fsync of the open segment regardless of the sync mode.
    pub fn sync(&self) -> WalResult<()> {
        let _writer = self.lock_writer()?;
        let mut active = self.lock_active()?;
        active.as_mut().ok_or(WalError::Closed)?.sync()
    }

    /// Sync the open segment and persist the metadata file.
    pub fn flush_meta(&self) -> WalResult<()> {
        let _writer = self.lock_writer()?;
        let bytes = {
            let state = self.read_state()?;
            state.ensure_open()?;
            meta::serialize_meta(&state.versions, &state.segments)?
        };
        {
            let mut active = self.lock_active()?;
            active.as_mut().ok_or(WalError::Closed)?.sync()?;
        }
        meta::write_meta(&self.dir, &bytes)
    }

    /// The metadata document as it would be persisted now.
    pub fn serialize_meta(&self) -> WalResult<Vec<u8>> {
        let state = self.read_state()?;
        meta::serialize_meta(&state.versions, &state.segments)
    }

    /// Replace the roll, retention and sync policy.
    pub fn alter(&self, config: WalConfig) -> WalResult<()> {
        let mut writer = self.lock_writer()?;
        self.read_state()?.ensure_open()?;
        info!(config = ?config, "Altered WAL configuration");
        writer.config = config;
        Ok(())
    }

    /// Flush metadata and release file handles. Idempotent.
    ///
    /// Every later call other than `close` fails with [`WalError::Closed`].
    /// If the sync or the metadata write fails the log stays open and
    /// `close` may be retried.
    pub fn close(&self) -> WalResult<()> {
        let _writer = self.lock_writer()?;
        let bytes = {
            let state = self.read_state()?;
            if state.closed {
                return Ok(());
            }
            meta::serialize_meta(&state.versions, &state.segments)?
        };

        if let Some(segment) = self.lock_active()?.as_mut() {
            segment.sync()?;
        }
        meta::write_meta(&self.dir, &bytes)?;

        self.write_state()?.closed = true;
        self.lock_active()?.take();

        info!(dir = %self.dir.display(), "Closed WAL");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// A copy of all five cursors.
    pub fn versions(&self) -> WalResult<VersionState> {
        Ok(self.read_state()?.versions.clone())
    }

    /// Smallest retained version, or `NO_VERSION` before the first append.
    pub fn first_ver(&self) -> WalResult<Version> {
        Ok(self.read_state()?.versions.first_ver)
    }

    /// Version of the most recent append.
    pub fn last_ver(&self) -> WalResult<Version> {
        Ok(self.read_state()?.versions.last_ver)
    }

    /// Highest committed version.
    pub fn commit_ver(&self) -> WalResult<Version> {
        Ok(self.read_state()?.versions.commit_ver)
    }

    /// Highest version covered by a completed snapshot.
    pub fn snapshot_ver(&self) -> WalResult<Version> {
        Ok(self.read_state()?.versions.snapshot_ver)
    }

    /// Target of the snapshot in progress, if any.
    pub fn ver_in_snapshotting(&self) -> WalResult<Option<Version>> {
        Ok(self.read_state()?.versions.ver_in_snapshotting)
    }

    /// A copy of the segment descriptors, oldest first.
    pub fn segments(&self) -> WalResult<Vec<SegmentDescriptor>> {
        Ok(self.read_state()?.segments.as_slice().to_vec())
    }

    /// The current policy.
    pub fn config(&self) -> WalResult<WalConfig> {
        Ok(self.lock_writer()?.config.clone())
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    fn lock_writer(&self) -> WalResult<MutexGuard<'_, WriterState>> {
        self.writer.lock().map_err(|_| WalError::LockPoisoned)
    }

    pub(crate) fn read_state(&self) -> WalResult<RwLockReadGuard<'_, LogState>> {
        self.state.read().map_err(|_| WalError::LockPoisoned)
    }

    fn write_state(&self) -> WalResult<RwLockWriteGuard<'_, LogState>> {
        self.state.write().map_err(|_| WalError::LockPoisoned)
    }

    fn lock_active(&self) -> WalResult<MutexGuard<'_, Option<ActiveSegment>>> {
        self.active.lock().map_err(|_| WalError::LockPoisoned)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(dir = %self.dir.display(), error = %e, "Failed to close WAL on drop");
        }
    }
}
