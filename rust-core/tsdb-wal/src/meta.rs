// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Metadata persistence and recovery
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The version state and segment registry are persisted together in a JSON
// side-car file (`meta.json`). The file is replaced atomically: written to a
// temporary name, fsynced, renamed over the old file, and the directory is
// fsynced. The metadata is a cache of what the segment files hold, so on
// recovery the tail of the newest segment is always re-read and wins over
// the recorded last version.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{WalError, WalResult};
use crate::segment::{
    list_log_files, log_path, remove_segment_files, SegmentDescriptor, SegmentRegistry, OPEN_TS,
};
use crate::segment_file::{repair_segment, scan_segment};
use crate::version::{VersionState, NO_VERSION};

/// Name of the metadata side-car file inside a WAL directory.
pub const META_FILENAME: &str = "meta.json";

/// Temporary name the metadata is written under before the atomic rename.
pub const META_TMP_FILENAME: &str = "meta.json.tmp";

#[derive(Serialize)]
struct MetaDocumentRef<'a> {
    versions: &'a VersionState,
    segments: &'a [SegmentDescriptor],
}

#[derive(Deserialize)]
struct MetaDocument {
    versions: VersionState,
    segments: Vec<SegmentDescriptor>,
}

/// Log state rebuilt by [`recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    /// Recovered cursors. No snapshot is in progress.
    pub versions: VersionState,
    /// Recovered registry; the last segment is open.
    pub segments: SegmentRegistry,
}

/// Render the version state and registry as deterministic bytes.
///
/// The same state always yields byte-identical output.
pub fn serialize_meta(versions: &VersionState, segments: &SegmentRegistry) -> WalResult<Vec<u8>> {
    let document = MetaDocumentRef {
        versions,
        segments: segments.as_slice(),
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Parse and validate a metadata document.
pub fn parse_meta(bytes: &[u8]) -> WalResult<(VersionState, SegmentRegistry)> {
    let document: MetaDocument = serde_json::from_slice(bytes)
        .map_err(|e| WalError::CorruptMetadata(format!("malformed document: {e}")))?;
    let segments = SegmentRegistry::from_descriptors(document.segments);
    validate_meta(&document.versions, &segments).map_err(WalError::CorruptMetadata)?;
    Ok((document.versions, segments))
}

/// Structural checks tying the cursors to the registry.
pub fn validate_meta(versions: &VersionState, segments: &SegmentRegistry) -> Result<(), String> {
    segments.validate()?;
    versions.validate()?;

    // validate() guarantees at least one segment.
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return Err("no segments".to_string());
    };
    if versions.first_ver != NO_VERSION && versions.first_ver != first.first_ver {
        return Err(format!(
            "first version {} does not match oldest segment start {}",
            versions.first_ver, first.first_ver
        ));
    }
    if versions.last_ver != last.last_ver {
        return Err(format!(
            "last version {} does not match newest segment end {}",
            versions.last_ver, last.last_ver
        ));
    }
    Ok(())
}

/// Durably replace the metadata file with `bytes`.
pub fn write_meta(wal_dir: &Path, bytes: &[u8]) -> WalResult<()> {
    let tmp_path = wal_dir.join(META_TMP_FILENAME);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, wal_dir.join(META_FILENAME))?;
    sync_dir(wal_dir)?;

    debug!(bytes = bytes.len(), dir = %wal_dir.display(), "Persisted WAL metadata");
    Ok(())
}

/// Read the metadata file. `Ok(None)` if there is none.
pub fn read_meta(wal_dir: &Path) -> WalResult<Option<(VersionState, SegmentRegistry)>> {
    match fs::read(wal_dir.join(META_FILENAME)) {
        Ok(bytes) => parse_meta(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Rebuild the log state of `wal_dir`.
///
/// Uses the metadata file when it is present and valid, otherwise
/// reconstructs a best-effort state from the segment files. Returns
/// `Ok(None)` for a directory holding no log at all.
pub fn recover(wal_dir: &Path, now_ms: i64) -> WalResult<Option<Recovered>> {
    match read_meta(wal_dir) {
        Ok(Some((versions, segments))) => match reconcile(wal_dir, versions, segments, now_ms) {
            Ok(recovered) => return Ok(Some(recovered)),
            Err(e @ WalError::CorruptMetadata(_)) => {
                warn!(error = %e, "WAL metadata disagrees with segment files, scanning directory");
            }
            Err(e) => return Err(e),
        },
        Ok(None) => debug!(dir = %wal_dir.display(), "No WAL metadata file"),
        Err(e) => {
            warn!(error = %e, "Unreadable WAL metadata, scanning directory");
        }
    }
    scan_directory(wal_dir, now_ms)
}

/// Bring loaded metadata in line with the segment files on disk.
fn reconcile(
    wal_dir: &Path,
    mut versions: VersionState,
    mut segments: SegmentRegistry,
    now_ms: i64,
) -> WalResult<Recovered> {
    // Trailing segments removed by an interrupted rollback.
    while segments.len() > 1 {
        let Some(last) = segments.last() else { break };
        if log_path(wal_dir, last.first_ver).exists() {
            break;
        }
        warn!(first_ver = last.first_ver, "Dropping WAL segment whose file is missing");
        segments.truncate_after(segments.len() - 2);
    }
    for segment in segments.iter() {
        if !log_path(wal_dir, segment.first_ver).exists() {
            return Err(WalError::CorruptMetadata(format!(
                "segment file for version {} is missing",
                segment.first_ver
            )));
        }
    }

    let files = list_log_files(wal_dir)?;
    let oldest = segments.first().map_or(0, |s| s.first_ver);
    for (first_ver, _) in files.iter().filter(|(v, _)| *v < oldest) {
        // Left behind by a retention sweep interrupted after the metadata write.
        warn!(first_ver, "Removing orphaned WAL segment below retained range");
        remove_segment_files(wal_dir, *first_ver)?;
    }

    rescan_last(wal_dir, &mut segments)?;

    let newest = segments.last().map_or(0, |s| s.first_ver);
    for (first_ver, _) in files.iter().filter(|(v, _)| *v > newest) {
        let Some(last) = segments.last() else { break };
        if last.is_empty() || *first_ver != last.last_ver + 1 {
            warn!(first_ver, "Ignoring WAL segment file that does not extend the log");
            break;
        }
        segments.close_last(now_ms);
        segments.push(SegmentDescriptor::new(*first_ver, now_ms));
        rescan_last(wal_dir, &mut segments)?;
        info!(first_ver, "Adopted WAL segment created after the last metadata write");
    }

    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return Err(WalError::CorruptMetadata("no segments".to_string()));
    };
    versions.last_ver = last.last_ver;
    if versions.first_ver == NO_VERSION && versions.last_ver >= first.first_ver {
        versions.first_ver = first.first_ver;
    }
    if versions.commit_ver > versions.last_ver {
        warn!(
            commit_ver = versions.commit_ver,
            last_ver = versions.last_ver,
            "Committed WAL records missing from segment tail"
        );
        versions.commit_ver = versions.last_ver;
    }
    versions.snapshot_ver = versions.snapshot_ver.min(versions.commit_ver);
    versions.ver_in_snapshotting = None;

    validate_meta(&versions, &segments).map_err(WalError::CorruptMetadata)?;

    info!(
        first_ver = versions.first_ver,
        last_ver = versions.last_ver,
        commit_ver = versions.commit_ver,
        snapshot_ver = versions.snapshot_ver,
        segments = segments.len(),
        "Recovered WAL from metadata"
    );

    Ok(Recovered { versions, segments })
}

/// Re-derive the newest segment's range and size from its file and reopen it.
fn rescan_last(wal_dir: &Path, segments: &mut SegmentRegistry) -> WalResult<()> {
    let Some(last) = segments.last_mut() else {
        return Err(WalError::CorruptMetadata("no segments".to_string()));
    };
    let scan = scan_segment(&log_path(wal_dir, last.first_ver), last.first_ver)?;
    repair_segment(wal_dir, last.first_ver, &scan)?;

    if scan.last_ver != last.last_ver {
        info!(
            first_ver = last.first_ver,
            recorded = last.last_ver,
            on_disk = scan.last_ver,
            "Re-derived last version from WAL segment tail"
        );
    }
    last.last_ver = scan.last_ver;
    last.file_size = scan.valid_len;
    last.close_ts = OPEN_TS;
    Ok(())
}

/// Reconstruct log state from segment files alone.
///
/// Nothing is known to be committed, so the commit and snapshot cursors sit
/// just below the oldest retained version.
pub fn scan_directory(wal_dir: &Path, now_ms: i64) -> WalResult<Option<Recovered>> {
    let files = list_log_files(wal_dir)?;
    if files.is_empty() {
        return Ok(None);
    }

    let mut segments = SegmentRegistry::new();
    for (i, (first_ver, path)) in files.iter().enumerate() {
        let is_last = i + 1 == files.len();
        let scan = scan_segment(path, *first_ver)?;
        if !is_last && scan.torn_bytes > 0 {
            return Err(WalError::CorruptMetadata(format!(
                "closed segment starting at {first_ver} has {} corrupt trailing bytes",
                scan.torn_bytes
            )));
        }
        repair_segment(wal_dir, *first_ver, &scan)?;
        segments.push(SegmentDescriptor {
            first_ver: *first_ver,
            last_ver: scan.last_ver,
            create_ts: now_ms,
            close_ts: if is_last { OPEN_TS } else { now_ms },
            file_size: scan.valid_len,
        });
    }
    segments.validate().map_err(WalError::CorruptMetadata)?;

    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return Ok(None);
    };
    let base = first.first_ver;
    let last_ver = last.last_ver;
    let versions = VersionState {
        first_ver: if base == 0 && last_ver < 0 { NO_VERSION } else { base },
        snapshot_ver: base - 1,
        commit_ver: base - 1,
        last_ver,
        ver_in_snapshotting: None,
    };

    warn!(
        first_ver = versions.first_ver,
        last_ver,
        segments = segments.len(),
        "Reconstructed WAL state from directory scan"
    );

    Ok(Some(Recovered { versions, segments }))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> WalResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> WalResult<()> {
    Ok(())
}
