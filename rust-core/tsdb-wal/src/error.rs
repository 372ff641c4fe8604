// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines all error conditions that can arise during WAL operations: caller
// misuse of the version protocol, read-path integrity failures, metadata
// corruption and I/O failures.

use thiserror::Error;

use crate::version::Version;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An I/O error occurred while reading, writing or syncing a segment or
    /// the metadata file. Failed fsyncs are never retried.
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An append did not carry the next expected version, or targeted a
    /// version already covered by an in-flight snapshot. The log is unchanged.
    #[error("Out-of-order append: expected version {expected}, got {got}")]
    OutOfOrderVersion {
        /// The only version the log would have accepted.
        expected: Version,
        /// The version the caller supplied.
        got: Version,
    },

    /// A commit, rollback or snapshot target lies outside the legal range.
    #[error("Invalid version {version} for {op}: {reason}")]
    InvalidVersion {
        /// The operation that rejected the version.
        op: &'static str,
        /// The version the caller supplied.
        version: Version,
        /// Which bound was violated.
        reason: String,
    },

    /// `begin_snapshot` was called while another snapshot is in progress.
    #[error("Snapshot conflict: snapshot up to version {in_progress} already in progress")]
    SnapshotConflict {
        /// Target version of the snapshot already running.
        in_progress: Version,
    },

    /// A rollback was attempted while a snapshot is in progress.
    #[error("Rollback rejected: snapshot up to version {in_progress} in progress")]
    SnapshotInProgress {
        /// Target version of the snapshot already running.
        in_progress: Version,
    },

    /// `end_snapshot` was called with no snapshot in progress.
    #[error("No snapshot in progress")]
    NoSnapshotInProgress,

    /// The requested version is not retained by the log.
    #[error("Version {version} not found (log holds {first}..={last})")]
    VersionNotFound {
        /// The requested version.
        version: Version,
        /// First retained version at the time of the lookup.
        first: Version,
        /// Last appended version at the time of the lookup.
        last: Version,
    },

    /// A record failed its integrity checks (CRC, framing or embedded
    /// version) while being read back.
    #[error("Corrupt record at offset {offset} in segment {segment}: {reason}")]
    CorruptRecord {
        /// The segment file name.
        segment: String,
        /// Byte offset of the frame within the segment.
        offset: u64,
        /// What check failed.
        reason: String,
    },

    /// The metadata side-car file failed structural validation.
    #[error("Corrupt WAL metadata: {0}")]
    CorruptMetadata(String),

    /// JSON serialization of the metadata document failed.
    #[error("JSON error in WAL metadata: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload exceeds the maximum record size.
    #[error("Record payload of {length} bytes exceeds maximum {max_length}")]
    RecordTooLarge {
        /// The payload length supplied.
        length: usize,
        /// The maximum allowed payload length.
        max_length: usize,
    },

    /// A lock guarding log state was poisoned by a panicking thread.
    #[error("WAL lock poisoned")]
    LockPoisoned,

    /// The log has been closed.
    #[error("WAL is closed")]
    Closed,
}

/// Convenience type alias for WAL results.
pub type WalResult<T> = Result<T, WalError>;

impl WalError {
    /// Returns `true` for caller errors that can be retried after correcting
    /// the supplied version.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            WalError::OutOfOrderVersion { .. } | WalError::InvalidVersion { .. }
        )
    }
}
