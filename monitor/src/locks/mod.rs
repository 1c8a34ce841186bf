//! Lock conflict tracking and persistence

mod history;
mod tracker;

pub use history::{LockHistorySnapshot, LockHistoryStore, SNAPSHOT_VERSION};
pub use tracker::{
    LockConflict, LockConflictKey, LockHistoryEntry, LockTracker, TrackerSettings, TrackerStats,
};

use std::sync::{Arc, Mutex, MutexGuard};

/// Tracker shared between the tick path and the persistence task
pub type SharedTracker = Arc<Mutex<LockTracker>>;

/// Lock the shared tracker, recovering the guard if a holder panicked
pub fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, LockTracker> {
    tracker.lock().unwrap_or_else(|e| e.into_inner())
}
