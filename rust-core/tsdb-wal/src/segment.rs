// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Segment metadata registry
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Each segment is a pair of files named after the first version it holds:
// `{first_ver:020}.log` for record frames and `{first_ver:020}.idx` for the
// offset index. The registry is the ordered list of segment descriptors; it
// is pure data and makes no policy decisions of its own.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{WalError, WalResult};
use crate::version::Version;

/// The file extension used for segment log files.
pub const LOG_EXTENSION: &str = "log";

/// The file extension used for segment index files.
pub const INDEX_EXTENSION: &str = "idx";

/// `close_ts` of a segment still open for appends.
pub const OPEN_TS: i64 = -1;

/// Descriptor of one on-disk segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// First version stored in this segment.
    pub first_ver: Version,

    /// Last version stored in this segment; `first_ver - 1` while empty.
    pub last_ver: Version,

    /// Unix milliseconds when the segment was created.
    pub create_ts: i64,

    /// Unix milliseconds when the segment was closed, or [`OPEN_TS`].
    pub close_ts: i64,

    /// Bytes of valid frames in the log file.
    pub file_size: u64,
}

impl SegmentDescriptor {
    /// A new, empty, open segment starting at `first_ver`.
    pub fn new(first_ver: Version, create_ts: i64) -> Self {
        Self {
            first_ver,
            last_ver: first_ver - 1,
            create_ts,
            close_ts: OPEN_TS,
            file_size: 0,
        }
    }

    /// Returns `true` if the segment still accepts appends.
    pub fn is_open(&self) -> bool {
        self.close_ts == OPEN_TS
    }

    /// Returns `true` if the segment holds no records.
    pub fn is_empty(&self) -> bool {
        self.last_ver < self.first_ver
    }

    /// Number of records in the segment.
    pub fn record_count(&self) -> u64 {
        (self.last_ver - self.first_ver + 1).max(0) as u64
    }

    /// Returns `true` if `ver` is stored in this segment.
    pub fn contains(&self, ver: Version) -> bool {
        self.first_ver <= ver && ver <= self.last_ver
    }
}

/// Ordered collection of segment descriptors, ascending by `first_ver`.
///
/// Ranges are contiguous and non-overlapping, and only the last descriptor
/// may be open. Callers keep those invariants; `validate` checks them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentRegistry {
    segments: Vec<SegmentDescriptor>,
}

impl SegmentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from descriptors already in order.
    pub fn from_descriptors(segments: Vec<SegmentDescriptor>) -> Self {
        Self { segments }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` if there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// All descriptors in order.
    pub fn as_slice(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    /// Iterate descriptors in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SegmentDescriptor> {
        self.segments.iter()
    }

    /// The oldest segment.
    pub fn first(&self) -> Option<&SegmentDescriptor> {
        self.segments.first()
    }

    /// The newest (active) segment.
    pub fn last(&self) -> Option<&SegmentDescriptor> {
        self.segments.last()
    }

    /// Mutable access to the newest (active) segment.
    pub fn last_mut(&mut self) -> Option<&mut SegmentDescriptor> {
        self.segments.last_mut()
    }

    /// Descriptor at `index`.
    pub fn get(&self, index: usize) -> Option<&SegmentDescriptor> {
        self.segments.get(index)
    }

    /// Append a descriptor at the end.
    pub fn push(&mut self, segment: SegmentDescriptor) {
        self.segments.push(segment);
    }

    /// Mark the newest segment closed at `close_ts`.
    pub fn close_last(&mut self, close_ts: i64) {
        if let Some(last) = self.segments.last_mut() {
            last.close_ts = close_ts;
        }
    }

    /// Index of the segment storing `ver`, by binary search on `first_ver`.
    pub fn find(&self, ver: Version) -> Option<usize> {
        let after = self.segments.partition_point(|s| s.first_ver <= ver);
        let index = after.checked_sub(1)?;
        self.segments[index].contains(ver).then_some(index)
    }

    /// Drop every segment after `index`, returning them in order.
    pub fn truncate_after(&mut self, index: usize) -> Vec<SegmentDescriptor> {
        if index + 1 >= self.segments.len() {
            return Vec::new();
        }
        self.segments.split_off(index + 1)
    }

    /// Drop the `count` oldest segments, returning them in order.
    pub fn remove_front(&mut self, count: usize) -> Vec<SegmentDescriptor> {
        let count = count.min(self.segments.len());
        self.segments.drain(..count).collect()
    }

    /// Total bytes of all segments.
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.file_size).sum()
    }

    /// Check ordering, contiguity and the single-open-segment rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.segments.is_empty() {
            return Err("no segments".to_string());
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if segment.first_ver < 0 {
                return Err(format!("segment {index} starts at negative version"));
            }
            if segment.last_ver < segment.first_ver - 1 {
                return Err(format!(
                    "segment {index} ends at {} before it starts at {}",
                    segment.last_ver, segment.first_ver
                ));
            }
            let is_last = index + 1 == self.segments.len();
            if !is_last && segment.is_open() {
                return Err(format!("segment {index} is open but not the newest"));
            }
            if !is_last && segment.is_empty() {
                return Err(format!("closed segment {index} holds no records"));
            }
        }

        for pair in self.segments.windows(2) {
            if pair[1].first_ver != pair[0].last_ver + 1 {
                return Err(format!(
                    "segment starting at {} does not follow segment ending at {}",
                    pair[1].first_ver, pair[0].last_ver
                ));
            }
        }

        Ok(())
    }
}

/// Build the canonical log file name for a segment starting at `first_ver`.
///
/// Format: `00000000000000000042.log`
pub fn log_filename(first_ver: Version) -> String {
    format!("{first_ver:020}.{LOG_EXTENSION}")
}

/// Build the canonical index file name for a segment starting at `first_ver`.
pub fn index_filename(first_ver: Version) -> String {
    format!("{first_ver:020}.{INDEX_EXTENSION}")
}

/// Full path of a segment's log file.
pub fn log_path(wal_dir: &Path, first_ver: Version) -> PathBuf {
    wal_dir.join(log_filename(first_ver))
}

/// Full path of a segment's index file.
pub fn index_path(wal_dir: &Path, first_ver: Version) -> PathBuf {
    wal_dir.join(index_filename(first_ver))
}

/// Parse the first version from a segment log file name.
///
/// Returns `None` if the name does not match the expected pattern.
pub fn parse_log_filename(name: &str) -> Option<Version> {
    let stem = name.strip_suffix(&format!(".{LOG_EXTENSION}"))?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<Version>().ok()
}

/// Scan a WAL directory and return `(first_ver, path)` for every segment log
/// file, sorted by first version. Other files are ignored.
pub fn list_log_files(wal_dir: &Path) -> WalResult<Vec<(Version, PathBuf)>> {
    if !wal_dir.is_dir() {
        return Err(WalError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("WAL directory not found: {}", wal_dir.display()),
        )));
    }

    let mut files = Vec::new();
    for dir_entry in fs::read_dir(wal_dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        if let Some(first_ver) = parse_log_filename(&file_name.to_string_lossy()) {
            files.push((first_ver, dir_entry.path()));
        }
    }
    files.sort_by_key(|(first_ver, _)| *first_ver);

    debug!(
        count = files.len(),
        dir = %wal_dir.display(),
        "Discovered WAL segment files"
    );

    Ok(files)
}

/// Delete a segment's log and index files. A missing index is not an error.
pub fn remove_segment_files(wal_dir: &Path, first_ver: Version) -> WalResult<()> {
    fs::remove_file(log_path(wal_dir, first_ver))?;
    match fs::remove_file(index_path(wal_dir, first_ver)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    debug!(first_ver, dir = %wal_dir.display(), "Removed WAL segment files");
    Ok(())
}
