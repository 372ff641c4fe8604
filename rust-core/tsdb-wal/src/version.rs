// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Version state tracking
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The five logical cursors of a log and the legality rules for moving them.
// Every method validates before mutating, so a rejected call leaves the
// state exactly as it was.

use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};

/// A record's position in the log.
pub type Version = i64;

/// Sentinel for "no version" (empty log, nothing committed, no snapshot).
pub const NO_VERSION: Version = -1;

/// Cursor state of one open log.
///
/// `snapshot_ver <= commit_ver <= last_ver` always holds. `first_ver` is
/// [`NO_VERSION`] until the first append and afterwards equals the first
/// version of the oldest retained segment. The log is empty whenever
/// `last_ver < first_ver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    /// Smallest version still retained.
    pub first_ver: Version,

    /// Highest version covered by the last completed snapshot.
    pub snapshot_ver: Version,

    /// Highest version acknowledged as durably applied.
    pub commit_ver: Version,

    /// Version of the most recently appended record.
    pub last_ver: Version,

    /// Target of the snapshot currently being taken. Not persisted: an
    /// in-flight snapshot does not survive a restart.
    #[serde(skip)]
    pub ver_in_snapshotting: Option<Version>,
}

impl Default for VersionState {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionState {
    /// State of a freshly created, never written log.
    pub fn new() -> Self {
        Self {
            first_ver: NO_VERSION,
            snapshot_ver: NO_VERSION,
            commit_ver: NO_VERSION,
            last_ver: NO_VERSION,
            ver_in_snapshotting: None,
        }
    }

    /// Returns `true` if the log holds no readable record.
    pub fn is_empty(&self) -> bool {
        self.first_ver == NO_VERSION || self.last_ver < self.first_ver
    }

    /// The only version the next append may carry.
    pub fn next_version(&self) -> Version {
        self.last_ver + 1
    }

    /// Returns `true` while a snapshot is being taken.
    pub fn is_snapshotting(&self) -> bool {
        self.ver_in_snapshotting.is_some()
    }

    /// Validate an append of `ver`.
    ///
    /// Legal iff `ver` is exactly `last_ver + 1` and not covered by an
    /// in-flight snapshot.
    pub fn check_append(&self, ver: Version) -> WalResult<()> {
        let expected = self.next_version();
        if ver != expected {
            return Err(WalError::OutOfOrderVersion { expected, got: ver });
        }
        if let Some(snapshotting) = self.ver_in_snapshotting {
            if ver <= snapshotting {
                return Err(WalError::OutOfOrderVersion { expected, got: ver });
            }
        }
        Ok(())
    }

    /// Record a successful append of `ver`. Call only after `check_append`.
    pub fn record_append(&mut self, ver: Version) {
        if self.first_ver == NO_VERSION {
            self.first_ver = ver;
        }
        self.last_ver = ver;
    }

    /// Acknowledge everything up to and including `ver` as applied.
    pub fn commit(&mut self, ver: Version) -> WalResult<()> {
        if ver <= self.commit_ver {
            return Err(invalid("commit", ver, format!(
                "not above commit version {}",
                self.commit_ver
            )));
        }
        if ver > self.last_ver {
            return Err(invalid("commit", ver, format!(
                "beyond last version {}",
                self.last_ver
            )));
        }
        self.commit_ver = ver;
        Ok(())
    }

    /// Validate a rollback that would discard `ver` and everything after it.
    pub fn check_rollback(&self, ver: Version) -> WalResult<()> {
        if let Some(in_progress) = self.ver_in_snapshotting {
            return Err(WalError::SnapshotInProgress { in_progress });
        }
        if ver > self.last_ver {
            return Err(invalid("rollback", ver, format!(
                "beyond last version {}",
                self.last_ver
            )));
        }
        if ver <= self.commit_ver {
            return Err(invalid("rollback", ver, format!(
                "at or below commit version {}",
                self.commit_ver
            )));
        }
        Ok(())
    }

    /// Apply a rollback validated by `check_rollback`.
    pub fn apply_rollback(&mut self, ver: Version) {
        self.last_ver = ver - 1;
    }

    /// Start a snapshot covering everything up to `ver`.
    pub fn begin_snapshot(&mut self, ver: Version) -> WalResult<()> {
        if let Some(in_progress) = self.ver_in_snapshotting {
            return Err(WalError::SnapshotConflict { in_progress });
        }
        if ver > self.commit_ver {
            return Err(invalid("snapshot", ver, format!(
                "beyond commit version {}",
                self.commit_ver
            )));
        }
        if ver <= self.snapshot_ver {
            return Err(invalid("snapshot", ver, format!(
                "not above snapshot version {}",
                self.snapshot_ver
            )));
        }
        self.ver_in_snapshotting = Some(ver);
        Ok(())
    }

    /// Complete the in-flight snapshot and return its version.
    pub fn end_snapshot(&mut self) -> WalResult<Version> {
        let ver = self
            .ver_in_snapshotting
            .take()
            .ok_or(WalError::NoSnapshotInProgress)?;
        self.snapshot_ver = ver;
        Ok(ver)
    }

    /// Check the cursor ordering invariants. Used when loading persisted state.
    pub fn validate(&self) -> Result<(), String> {
        if self.snapshot_ver > self.commit_ver {
            return Err(format!(
                "snapshot version {} above commit version {}",
                self.snapshot_ver, self.commit_ver
            ));
        }
        if self.commit_ver > self.last_ver {
            return Err(format!(
                "commit version {} above last version {}",
                self.commit_ver, self.last_ver
            ));
        }
        if self.first_ver < NO_VERSION || self.last_ver < NO_VERSION {
            return Err("negative version below sentinel".to_string());
        }
        if self.first_ver != NO_VERSION && self.first_ver > self.snapshot_ver + 1 {
            return Err(format!(
                "first version {} beyond snapshot version {}",
                self.first_ver, self.snapshot_ver
            ));
        }
        Ok(())
    }
}

fn invalid(op: &'static str, version: Version, reason: String) -> WalError {
    WalError::InvalidVersion {
        op,
        version,
        reason,
    }
}
