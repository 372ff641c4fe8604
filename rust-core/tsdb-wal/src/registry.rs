// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Process-wide registry of open logs
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The storage engine owns one `WalRegistry`, constructed at startup and torn
// down at shutdown. Opening the same directory twice yields the same `Wal`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::wal::Wal;

/// Open logs keyed by canonical directory path.
#[derive(Debug)]
pub struct WalRegistry {
    clock: Arc<dyn Clock>,
    logs: RwLock<HashMap<PathBuf, Arc<Wal>>>,
}

impl Default for WalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WalRegistry {
    /// An empty registry using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// An empty registry whose logs read time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Open the log in `dir`, or return the already open one.
    ///
    /// `config` only applies when the log is not open yet.
    pub fn open(&self, dir: impl AsRef<Path>, config: WalConfig) -> WalResult<Arc<Wal>> {
        fs::create_dir_all(dir.as_ref())?;
        let key = fs::canonicalize(dir.as_ref())?;

        let mut logs = self.logs.write().map_err(|_| WalError::LockPoisoned)?;
        if let Some(existing) = logs.get(&key) {
            debug!(dir = %key.display(), "WAL already open, reusing");
            return Ok(Arc::clone(existing));
        }

        let wal = Wal::open_with_clock(&key, config, Arc::clone(&self.clock))?;
        logs.insert(key, Arc::clone(&wal));
        Ok(wal)
    }

    /// The open log for `dir`, if any.
    pub fn get(&self, dir: impl AsRef<Path>) -> WalResult<Option<Arc<Wal>>> {
        let Ok(key) = fs::canonicalize(dir.as_ref()) else {
            return Ok(None);
        };
        let logs = self.logs.read().map_err(|_| WalError::LockPoisoned)?;
        Ok(logs.get(&key).cloned())
    }

    /// Close the log for `dir` and forget it. Returns `false` if it was not
    /// open.
    pub fn close(&self, dir: impl AsRef<Path>) -> WalResult<bool> {
        let Ok(key) = fs::canonicalize(dir.as_ref()) else {
            return Ok(false);
        };
        let removed = self
            .logs
            .write()
            .map_err(|_| WalError::LockPoisoned)?
            .remove(&key);
        match removed {
            Some(wal) => {
                wal.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every log. All logs are attempted; the first failure is
    /// returned.
    pub fn close_all(&self) -> WalResult<()> {
        let drained: Vec<(PathBuf, Arc<Wal>)> = self
            .logs
            .write()
            .map_err(|_| WalError::LockPoisoned)?
            .drain()
            .collect();

        let count = drained.len();
        let mut first_error = None;
        for (dir, wal) in drained {
            if let Err(e) = wal.close() {
                warn!(dir = %dir.display(), error = %e, "Failed to close WAL");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        info!(logs = count, "Closed all WALs");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of open logs.
    pub fn len(&self) -> usize {
        self.logs.read().map(|logs| logs.len()).unwrap_or(0)
    }

    /// Returns `true` if no log is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
