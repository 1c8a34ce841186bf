//! Lock accumulation state machine
//!
//! Each blocker/blocked pair moves through
//! `absent -> tracked(start, last) -> escalate -> tracked ... -> absent`.
//! An escalation emits one critical `lock_accumulation` finding and restarts
//! the accumulation period. Entries that stop being observed for longer than
//! the grace window are dropped, so a reappearing conflict starts from zero.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LockMonitoringConfig;
use crate::model::{Finding, FindingMetrics, FindingType, Level, LockDetails};
use crate::source::{fields, Row};

/// Identity of one lock conflict
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct LockConflictKey {
    pub blocker_session: i64,
    pub blocked_session: i64,
    pub resource: Option<String>,
}

impl fmt::Display for LockConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}:{}:{}", self.blocker_session, self.blocked_session, resource),
            None => write!(f, "{}:{}", self.blocker_session, self.blocked_session),
        }
    }
}

impl FromStr for LockConflictKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let blocker = parts.next().and_then(|p| p.parse().ok());
        let blocked = parts.next().and_then(|p| p.parse().ok());
        match (blocker, blocked) {
            (Some(blocker_session), Some(blocked_session)) => Ok(Self {
                blocker_session,
                blocked_session,
                resource: parts.next().map(str::to_string),
            }),
            _ => Err(format!("invalid lock conflict key: {}", s)),
        }
    }
}

impl From<LockConflictKey> for String {
    fn from(key: LockConflictKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for LockConflictKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One observed blocked/blocking pair, as reported by the data source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConflict {
    pub blocked_session_id: i64,
    pub blocker_session_id: i64,
    pub database: Option<String>,
    pub resource: Option<String>,
    pub resource_type: Option<String>,
    pub object_name: Option<String>,
    pub blocked_lock_mode: Option<String>,
    pub blocker_lock_mode: Option<String>,
    pub wait_time_ms: u64,
    pub wait_type: Option<String>,
    pub blocked_host: Option<String>,
    pub blocker_host: Option<String>,
    pub blocked_program: Option<String>,
    pub blocker_program: Option<String>,
    pub blocked_query: Option<String>,
    pub blocker_query: Option<String>,
}

impl LockConflict {
    /// Read a `blockingPairs` row; rows without both session ids are skipped
    pub fn from_row(row: &Row) -> Option<Self> {
        let blocked_session_id = row
            .i64(fields::BLOCKED_SESSION_ID)
            .or_else(|| row.i64(fields::SESSION_ID))?;
        let blocker_session_id = row
            .i64(fields::BLOCKER_SESSION_ID)
            .or_else(|| row.i64(fields::BLOCKING_SESSION_ID))?;

        Some(Self {
            blocked_session_id,
            blocker_session_id,
            database: row.text(fields::DATABASE),
            resource: row.text(fields::RESOURCE),
            resource_type: row.text(fields::RESOURCE_TYPE),
            object_name: row.text(fields::OBJECT_NAME),
            blocked_lock_mode: row.text(fields::BLOCKED_LOCK_MODE),
            blocker_lock_mode: row.text(fields::BLOCKER_LOCK_MODE),
            wait_time_ms: row
                .u64(fields::WAIT_TIME_MS)
                .or_else(|| row.u64(fields::ELAPSED_MS))
                .unwrap_or(0),
            wait_type: row.text(fields::WAIT_TYPE),
            blocked_host: row.text(fields::BLOCKED_HOST),
            blocker_host: row.text(fields::BLOCKER_HOST),
            blocked_program: row.text(fields::BLOCKED_PROGRAM),
            blocker_program: row.text(fields::BLOCKER_PROGRAM),
            blocked_query: row.text(fields::BLOCKED_TEXT).or_else(|| row.text(fields::TEXT)),
            blocker_query: row.text(fields::BLOCKER_TEXT),
        })
    }

    pub fn key(&self) -> LockConflictKey {
        LockConflictKey {
            blocker_session: self.blocker_session_id,
            blocked_session: self.blocked_session_id,
            resource: self.resource.clone(),
        }
    }

    pub fn lock_details(&self) -> LockDetails {
        LockDetails {
            resource_type: self.resource_type.clone(),
            object_name: self.object_name.clone(),
            blocked_lock_mode: self.blocked_lock_mode.clone(),
            blocker_lock_mode: self.blocker_lock_mode.clone(),
            blocked_host: self.blocked_host.clone(),
            blocker_host: self.blocker_host.clone(),
            blocked_program: self.blocked_program.clone(),
            blocker_program: self.blocker_program.clone(),
            accumulated_seconds: None,
        }
    }

    /// Blocked and blocking statements combined for display
    pub fn combined_query_text(&self) -> Option<String> {
        match (&self.blocked_query, &self.blocker_query) {
            (Some(blocked), Some(blocker)) => {
                Some(format!("[Blocked] {}\n[Blocker] {}", blocked, blocker))
            }
            (Some(blocked), None) => Some(format!("[Blocked] {}", blocked)),
            (None, Some(blocker)) => Some(format!("[Blocker] {}", blocker)),
            (None, None) => None,
        }
    }
}

/// Tracked state of one conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHistoryEntry {
    pub start_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub data: LockConflict,
    #[serde(default)]
    pub alerts_fired: u32,
}

/// Tracker tuning, taken from `lock_monitoring`
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub accumulation: Duration,
    pub grace: Duration,
    pub max_entries: usize,
    pub repeat_alerts: bool,
}

impl From<&LockMonitoringConfig> for TrackerSettings {
    fn from(config: &LockMonitoringConfig) -> Self {
        Self {
            accumulation: Duration::minutes(config.accumulation_minutes as i64),
            grace: Duration::seconds(config.grace_seconds as i64),
            max_entries: config.max_entries.max(1),
            repeat_alerts: config.repeat_alerts,
        }
    }
}

/// Point-in-time tracker statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerStats {
    pub total_entries: usize,
    pub max_entries: usize,
    pub usage_percent: f64,
    pub avg_duration_seconds: f64,
    pub max_duration_seconds: i64,
    pub oldest_entry: Option<String>,
    pub evictions: u64,
}

#[derive(Debug)]
struct Tracked {
    entry: LockHistoryEntry,
    touched: u64,
}

/// Bounded map of ongoing lock conflicts with least-recently-touched eviction
#[derive(Debug)]
pub struct LockTracker {
    settings: TrackerSettings,
    entries: HashMap<LockConflictKey, Tracked>,
    recency: BTreeMap<u64, LockConflictKey>,
    next_touch: u64,
    evictions: u64,
}

impl LockTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_touch: 0,
            evictions: 0,
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &LockConflictKey) -> Option<&LockHistoryEntry> {
        self.entries.get(key).map(|tracked| &tracked.entry)
    }

    pub fn contains(&self, key: &LockConflictKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Feed one tick's conflict set and return any escalations.
    pub fn observe(&mut self, conflicts: &[LockConflict], now: DateTime<Utc>) -> Vec<Finding> {
        let mut findings = Vec::new();

        for conflict in conflicts {
            let key = conflict.key();
            if self.entries.contains_key(&key) {
                self.touch(&key);
            } else {
                let entry = LockHistoryEntry {
                    start_time: now,
                    last_seen: now,
                    data: conflict.clone(),
                    alerts_fired: 0,
                };
                self.insert(key.clone(), entry);
                debug!(key = %key, "Tracking new lock conflict");
            }

            let accumulation = self.settings.accumulation;
            let repeat = self.settings.repeat_alerts;
            let Some(tracked) = self.entries.get_mut(&key) else {
                continue;
            };
            tracked.entry.last_seen = now;
            tracked.entry.data = conflict.clone();

            let elapsed = now - tracked.entry.start_time;
            if elapsed >= accumulation && (repeat || tracked.entry.alerts_fired == 0) {
                findings.push(accumulation_finding(&key, &tracked.entry, elapsed, now));
                tracked.entry.alerts_fired += 1;
                tracked.entry.start_time = now;
            }
        }

        self.prune(now);
        findings
    }

    /// Remove entries unseen for longer than the grace window
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let grace = self.settings.grace;
        let stale: Vec<LockConflictKey> = self
            .entries
            .iter()
            .filter(|(_, tracked)| now - tracked.entry.last_seen > grace)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(tracked) = self.entries.remove(key) {
                self.recency.remove(&tracked.touched);
                debug!(key = %key, "Lock conflict resolved");
            }
        }
        stale.len()
    }

    /// Entries ordered from least to most recently touched
    pub fn entries_by_recency(&self) -> Vec<(LockConflictKey, LockHistoryEntry)> {
        self.recency
            .values()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|tracked| (key.clone(), tracked.entry.clone()))
            })
            .collect()
    }

    /// Replace the tracked state with persisted entries.
    ///
    /// Entries last seen more than `max_age` ago are discarded. Order is
    /// preserved, so the first entries are the first to be evicted.
    pub fn restore(
        &mut self,
        entries: Vec<(LockConflictKey, LockHistoryEntry)>,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> usize {
        self.entries.clear();
        self.recency.clear();

        for (key, entry) in entries {
            if now - entry.last_seen > max_age {
                continue;
            }
            if self.entries.contains_key(&key) {
                self.touch(&key);
                if let Some(tracked) = self.entries.get_mut(&key) {
                    tracked.entry = entry;
                }
            } else {
                self.insert(key, entry);
            }
        }
        self.entries.len()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> TrackerStats {
        let total = self.entries.len();
        let durations: Vec<(i64, &LockConflictKey)> = self
            .entries
            .iter()
            .map(|(key, tracked)| ((now - tracked.entry.start_time).num_seconds().max(0), key))
            .collect();

        let sum: i64 = durations.iter().map(|(d, _)| *d).sum();
        let longest = durations.iter().max_by_key(|(d, _)| *d);

        TrackerStats {
            total_entries: total,
            max_entries: self.settings.max_entries,
            usage_percent: total as f64 * 100.0 / self.settings.max_entries as f64,
            avg_duration_seconds: if total == 0 { 0.0 } else { sum as f64 / total as f64 },
            max_duration_seconds: longest.map(|(d, _)| *d).unwrap_or(0),
            oldest_entry: longest.map(|(_, key)| key.to_string()),
            evictions: self.evictions,
        }
    }

    fn touch(&mut self, key: &LockConflictKey) {
        let stamp = self.next_stamp();
        if let Some(tracked) = self.entries.get_mut(key) {
            self.recency.remove(&tracked.touched);
            tracked.touched = stamp;
            self.recency.insert(stamp, key.clone());
        }
    }

    fn insert(&mut self, key: LockConflictKey, entry: LockHistoryEntry) {
        while self.entries.len() >= self.settings.max_entries {
            if !self.evict_least_recent() {
                break;
            }
        }
        let stamp = self.next_stamp();
        self.recency.insert(stamp, key.clone());
        self.entries.insert(
            key,
            Tracked {
                entry,
                touched: stamp,
            },
        );
    }

    fn evict_least_recent(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        self.entries.remove(&key);
        self.evictions += 1;
        warn!(key = %key, capacity = self.settings.max_entries, "Lock history full, evicted least recently seen conflict");
        true
    }

    fn next_stamp(&mut self) -> u64 {
        self.next_touch += 1;
        self.next_touch
    }
}

fn accumulation_finding(
    key: &LockConflictKey,
    entry: &LockHistoryEntry,
    elapsed: Duration,
    now: DateTime<Utc>,
) -> Finding {
    let conflict = &entry.data;
    let minutes = elapsed.num_seconds() as f64 / 60.0;
    let mut details = conflict.lock_details();
    details.accumulated_seconds = Some(elapsed.num_seconds());

    Finding::new(
        FindingType::LockAccumulation,
        Level::Critical,
        format!(
            "Lock conflict {} persisted for {:.1} minutes: session {} blocked by session {}",
            key, minutes, conflict.blocked_session_id, conflict.blocker_session_id
        ),
    )
    .at(now)
    .with_session(Some(conflict.blocked_session_id))
    .with_database(conflict.database.clone())
    .with_metrics(FindingMetrics {
        execution_time_ms: Some(conflict.wait_time_ms),
        wait_type: conflict.wait_type.clone(),
        blocking_session_id: Some(conflict.blocker_session_id),
        ..FindingMetrics::default()
    })
    .with_query_text(conflict.combined_query_text().as_deref())
    .with_lock_details(details)
}
