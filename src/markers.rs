//! Small marker files that carry state across power cycles.

use crate::clock::{datetime_string, parse_datetime};
use crate::error::Result;
use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Zero-length presence flag: set means "the previous cycle left undelivered uploads".
#[derive(Debug, Clone)]
pub struct ReattemptFlag {
    path: PathBuf,
}

impl ReattemptFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn is_set(&self) -> bool {
        self.path.is_file()
    }

    pub fn set(&self) -> Result<()> {
        ensure_parent(&self.path)?;
        std::fs::write(&self.path, b"")?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_present(&self.path)
    }
}

/// Time of the last successful clock sync.
#[derive(Debug, Clone)]
pub struct ClockSyncMarker {
    path: PathBuf,
}

impl ClockSyncMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, at: DateTime<Utc>) -> Result<()> {
        ensure_parent(&self.path)?;
        std::fs::write(&self.path, datetime_string(&at))?;
        Ok(())
    }

    /// Forces a resync on the next wake.
    pub fn invalidate(&self) -> Result<()> {
        if self.path.exists() {
            info!("Invalidating clock sync marker");
        }
        remove_if_present(&self.path)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        read_first_timestamp(&self.path)
    }

    /// False when never synced, when the clock reads 2020 or earlier, or
    /// when the last sync is older than `resync_hours`.
    pub fn is_fresh(&self, now: DateTime<Utc>, resync_hours: u64) -> bool {
        if now.year() <= 2020 {
            return false;
        }

        let Some(synced_at) = self.last_sync() else {
            return false;
        };

        let elapsed = (now - synced_at).num_seconds();
        // A sync time slightly ahead of the clock is possible after a correction.
        if elapsed < 0 {
            return false;
        }

        if elapsed < (resync_hours as i64) * 3600 {
            return true;
        }

        info!("Clock has not been synced for {} hour(s)", resync_hours);
        false
    }
}

/// Time of the previous reading, used for rain rates.
#[derive(Debug, Clone)]
pub struct LastReadingMarker {
    path: PathBuf,
}

impl LastReadingMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Zero when no previous reading is recorded.
    pub fn seconds_since(&self, now: DateTime<Utc>) -> i64 {
        match read_first_timestamp(&self.path) {
            Some(last) => {
                let secs = (now - last).num_seconds();
                debug!("Seconds since last reading: {}", secs);
                secs
            }
            None => 0,
        }
    }

    pub fn record(&self, at: DateTime<Utc>) -> Result<()> {
        ensure_parent(&self.path)?;
        std::fs::write(&self.path, datetime_string(&at))?;
        Ok(())
    }
}

fn read_first_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let content = std::fs::read_to_string(path).ok()?;
    let line = content.lines().find(|l| !l.trim().is_empty())?;
    match parse_datetime(line) {
        Ok(ts) => Some(ts),
        Err(e) => {
            warn!("Ignoring unreadable marker {}: {}", path.display(), e);
            None
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
