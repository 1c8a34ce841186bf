//! Lock history snapshot persistence

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::tracker::{LockConflictKey, LockHistoryEntry, LockTracker};
use crate::config::LockMonitoringConfig;
use crate::error::{HistoryError, HistoryResult};

pub const SNAPSHOT_VERSION: &str = "1.0";

/// On-disk form: `{version, timestamp, entries: [[key, {startTime, lastSeen, data}]]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHistorySnapshot {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub entries: Vec<(LockConflictKey, LockHistoryEntry)>,
}

impl LockHistorySnapshot {
    pub fn capture(tracker: &LockTracker, now: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: now,
            entries: tracker.entries_by_recency(),
        }
    }
}

/// Reads and writes the snapshot file
#[derive(Debug, Clone)]
pub struct LockHistoryStore {
    path: PathBuf,
    max_age: Duration,
}

impl LockHistoryStore {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn from_config(config: &LockMonitoringConfig) -> Self {
        Self::new(
            config.persist_path.clone(),
            Duration::minutes(config.max_age_on_load_minutes as i64),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically (temp file, then rename)
    pub fn write(&self, snapshot: &LockHistorySnapshot) -> HistoryResult<()> {
        let write_failed = |reason: String| HistoryError::WriteFailed {
            path: self.path.display().to_string(),
            reason,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_failed(e.to_string()))?;
        }

        let content = serde_json::to_vec_pretty(snapshot).map_err(|e| write_failed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| write_failed(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| write_failed(e.to_string()))?;

        debug!(path = %self.path.display(), entries = snapshot.entries.len(), "Lock history saved");
        Ok(())
    }

    /// Capture and write the tracker's current state
    pub fn save(&self, tracker: &LockTracker, now: DateTime<Utc>) -> HistoryResult<()> {
        self.write(&LockHistorySnapshot::capture(tracker, now))
    }

    /// Read the snapshot; `Ok(None)` when no file exists yet
    pub fn read(&self) -> HistoryResult<Option<LockHistorySnapshot>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HistoryError::ReadFailed {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let snapshot: LockHistorySnapshot =
            serde_json::from_str(&content).map_err(|e| HistoryError::ReadFailed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(HistoryError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: snapshot.version,
            });
        }

        Ok(Some(snapshot))
    }

    /// Load persisted history into `tracker`.
    ///
    /// Never fails: unreadable, malformed or mismatched files leave the
    /// tracker empty.
    pub fn restore_into(&self, tracker: &mut LockTracker, now: DateTime<Utc>) -> usize {
        match self.read() {
            Ok(Some(snapshot)) => {
                let total = snapshot.entries.len();
                let loaded = tracker.restore(snapshot.entries, now, self.max_age);
                info!(
                    path = %self.path.display(),
                    loaded,
                    discarded = total.saturating_sub(loaded),
                    "Lock history restored"
                );
                loaded
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "No lock history to restore");
                0
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable lock history");
                tracker.restore(Vec::new(), now, self.max_age);
                0
            }
        }
    }
}
