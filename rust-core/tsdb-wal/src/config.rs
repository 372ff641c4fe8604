// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Configuration
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Roll, retention and durability policy for one log. Non-positive values
// disable the corresponding trigger, so the default configuration keeps a
// single segment forever and only drops history when a snapshot completes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controls how aggressively the writer calls `fsync` to flush data to
/// stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Call `fsync` after every single append. Acknowledged writes survive a
    /// crash, at the cost of throughput.
    Fsync,

    /// Call `fsync` at most once per the specified duration. Writes between
    /// syncs may be lost on crash.
    Periodic(Duration),

    /// Never explicitly call `fsync` on append; rely on the OS page cache.
    Async,
}

/// Policy for one write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Roll the active segment once it has been open this many seconds.
    /// `<= 0` disables time-based rolling.
    pub roll_period_secs: i64,

    /// Roll the active segment before it would grow past this many bytes.
    /// `<= 0` disables size-based rolling.
    pub seg_size: i64,

    /// Keep segments below the snapshot floor until they have been closed
    /// this many seconds. `0` keeps nothing beyond snapshot-driven retention.
    pub retention_period_secs: i64,

    /// Keep at least this many bytes of log on disk when sweeping segments
    /// below the snapshot floor. `0` keeps nothing beyond snapshot-driven
    /// retention.
    pub retention_size: i64,

    /// Durability level of the append path.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            roll_period_secs: -1,
            seg_size: -1,
            retention_period_secs: 0,
            retention_size: 0,
            sync_mode: SyncMode::Fsync,
        }
    }
}

impl WalConfig {
    /// Set the size-based roll threshold in bytes.
    pub fn with_seg_size(mut self, bytes: i64) -> Self {
        self.seg_size = bytes;
        self
    }

    /// Set the time-based roll period in seconds.
    pub fn with_roll_period(mut self, secs: i64) -> Self {
        self.roll_period_secs = secs;
        self
    }

    /// Set both retention knobs.
    pub fn with_retention(mut self, period_secs: i64, size_bytes: i64) -> Self {
        self.retention_period_secs = period_secs;
        self.retention_size = size_bytes;
        self
    }

    /// Set the durability level.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Segment size limit, if size-based rolling is enabled.
    pub fn segment_size_limit(&self) -> Option<u64> {
        (self.seg_size > 0).then_some(self.seg_size as u64)
    }

    /// Roll period in milliseconds, if time-based rolling is enabled.
    pub fn roll_period_ms(&self) -> Option<i64> {
        (self.roll_period_secs > 0).then(|| self.roll_period_secs.saturating_mul(1000))
    }

    /// Retention period in milliseconds, if enabled.
    pub fn retention_period_ms(&self) -> Option<i64> {
        (self.retention_period_secs > 0).then(|| self.retention_period_secs.saturating_mul(1000))
    }

    /// Retained byte floor, if enabled.
    pub fn retention_size_limit(&self) -> Option<u64> {
        (self.retention_size > 0).then_some(self.retention_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_rolling_and_retention() {
        let config = WalConfig::default();
        assert_eq!(config.segment_size_limit(), None);
        assert_eq!(config.roll_period_ms(), None);
        assert_eq!(config.retention_period_ms(), None);
        assert_eq!(config.retention_size_limit(), None);
        assert_eq!(config.sync_mode, SyncMode::Fsync);
    }

    #[test]
    fn test_builders() {
        let config = WalConfig::default()
            .with_seg_size(4096)
            .with_roll_period(60)
            .with_retention(3600, 1 << 20)
            .with_sync_mode(SyncMode::Async);
        assert_eq!(config.segment_size_limit(), Some(4096));
        assert_eq!(config.roll_period_ms(), Some(60_000));
        assert_eq!(config.retention_period_ms(), Some(3_600_000));
        assert_eq!(config.retention_size_limit(), Some(1 << 20));
        assert_eq!(config.sync_mode, SyncMode::Async);
    }

    #[test]
    fn test_zero_disables_triggers() {
        let config = WalConfig::default().with_seg_size(0).with_roll_period(0);
        assert_eq!(config.segment_size_limit(), None);
        assert_eq!(config.roll_period_ms(), None);
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: WalConfig = serde_json::from_str(r#"{"seg_size": 1024}"#).unwrap();
        assert_eq!(config.seg_size, 1024);
        assert_eq!(config.roll_period_secs, -1);
        assert_eq!(config.sync_mode, SyncMode::Fsync);
    }

    #[test]
    fn test_sync_mode_serde() {
        let json = serde_json::to_string(&SyncMode::Async).unwrap();
        assert_eq!(json, r#""async""#);

        let periodic = SyncMode::Periodic(Duration::from_millis(250));
        let json = serde_json::to_string(&periodic).unwrap();
        let restored: SyncMode = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, periodic);
    }
}
