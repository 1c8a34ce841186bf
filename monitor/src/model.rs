//! Finding data model
//!
//! A [`Finding`] is one anomaly detected by one check during one tick. It
//! lives only for the length of the dispatch pipeline; the daily alert log is
//! the only place it is written down.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::Analysis;

/// Hard upper bound on query text carried inside a finding.
///
/// Channels and the alert log apply their own, smaller limits on top.
pub const MAX_FINDING_QUERY_CHARS: usize = 4000;

/// Severity tier of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Critical,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Info, Level::Warning, Level::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Critical => "critical",
        }
    }

    /// Hex color used by HTML and card-style payloads
    pub fn color(&self) -> &'static str {
        match self {
            Level::Critical => "#dc3545",
            Level::Warning => "#ffc107",
            Level::Info => "#17a2b8",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    SlowOperation,
    Blocking,
    WatchQuery,
    HighCpu,
    UnusedIndex,
    LowCacheHit,
    LockAccumulation,
}

impl FindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingType::SlowOperation => "slow_operation",
            FindingType::Blocking => "blocking",
            FindingType::WatchQuery => "watch_query",
            FindingType::HighCpu => "high_cpu",
            FindingType::UnusedIndex => "unused_index",
            FindingType::LowCacheHit => "low_cache_hit",
            FindingType::LockAccumulation => "lock_accumulation",
        }
    }

    /// Human readable title, e.g. `SLOW OPERATION`
    pub fn title(&self) -> String {
        self.as_str().replace('_', " ").to_uppercase()
    }
}

impl fmt::Display for FindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric a threshold set applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    ExecutionTime,
    CpuTime,
    BlockingTime,
}

impl Metric {
    pub fn field_name(&self) -> &'static str {
        match self {
            Metric::ExecutionTime => "execution_time_ms",
            Metric::CpuTime => "cpu_time_ms",
            Metric::BlockingTime => "blocking_time_ms",
        }
    }
}

/// Ordered floors for one metric
///
/// A missing tier never matches. Present tiers satisfy
/// `info <= warning <= critical` once the configuration is validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdSet {
    pub info: Option<u64>,
    pub warning: Option<u64>,
    pub critical: Option<u64>,
}

impl ThresholdSet {
    pub fn new(info: Option<u64>, warning: Option<u64>, critical: Option<u64>) -> Self {
        Self {
            info,
            warning,
            critical,
        }
    }

    /// Whether the present tiers are in non-decreasing order
    pub fn is_ordered(&self) -> bool {
        let tiers: Vec<u64> = [self.info, self.warning, self.critical]
            .into_iter()
            .flatten()
            .collect();
        tiers.windows(2).all(|pair| pair[0] <= pair[1])
    }

    /// Lowest configured floor, if any
    pub fn lowest_floor(&self) -> Option<u64> {
        [self.info, self.warning, self.critical]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Numeric measurements attached to a finding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingMetrics {
    pub execution_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub logical_reads: Option<u64>,
    pub wait_type: Option<String>,
    pub blocking_session_id: Option<i64>,
}

/// Operator counts pulled from an execution plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlanSummary {
    pub table_scans: u64,
    pub index_scans: u64,
    pub index_seeks: u64,
}

/// Lock conflict detail for blocking and accumulation findings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDetails {
    pub resource_type: Option<String>,
    pub object_name: Option<String>,
    pub blocked_lock_mode: Option<String>,
    pub blocker_lock_mode: Option<String>,
    pub blocked_host: Option<String>,
    pub blocker_host: Option<String>,
    pub blocked_program: Option<String>,
    pub blocker_program: Option<String>,
    /// How long the conflict has been tracked, for accumulation findings
    pub accumulated_seconds: Option<i64>,
}

/// Index usage detail for unused-index findings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDetails {
    pub table_name: String,
    pub index_name: String,
    pub reads: u64,
    pub writes: u64,
}

/// Buffer cache detail for low-hit-ratio findings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDetails {
    pub hit_ratio_percent: f64,
    pub floor_percent: f64,
}

/// One detected anomaly instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub level: Level,
    pub message: String,
    pub session_id: Option<i64>,
    pub database: Option<String>,
    pub metrics: FindingMetrics,
    pub query_text: Option<String>,
    /// Watch-list name for watched-query findings
    pub query_name: Option<String>,
    pub execution_plan_summary: Option<ExecutionPlanSummary>,
    pub lock_details: Option<LockDetails>,
    pub index_details: Option<IndexDetails>,
    pub cache_details: Option<CacheDetails>,
    pub analysis: Option<Analysis>,
}

impl Finding {
    pub fn new(finding_type: FindingType, level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            finding_type,
            level,
            message: message.into(),
            session_id: None,
            database: None,
            metrics: FindingMetrics::default(),
            query_text: None,
            query_name: None,
            execution_plan_summary: None,
            lock_details: None,
            index_details: None,
            cache_details: None,
            analysis: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_session(mut self, session_id: Option<i64>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    pub fn with_metrics(mut self, metrics: FindingMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_query_text(mut self, text: Option<&str>) -> Self {
        self.query_text = text
            .filter(|t| !t.trim().is_empty())
            .map(|t| truncate_chars(t, MAX_FINDING_QUERY_CHARS, "..."));
        self
    }

    pub fn with_query_name(mut self, name: impl Into<String>) -> Self {
        self.query_name = Some(name.into());
        self
    }

    pub fn with_plan(mut self, plan: Option<ExecutionPlanSummary>) -> Self {
        self.execution_plan_summary = plan;
        self
    }

    pub fn with_lock_details(mut self, details: LockDetails) -> Self {
        self.lock_details = Some(details);
        self
    }

    pub fn with_index_details(mut self, details: IndexDetails) -> Self {
        self.index_details = Some(details);
        self
    }

    pub fn with_cache_details(mut self, details: CacheDetails) -> Self {
        self.cache_details = Some(details);
        self
    }
}

/// Truncate `text` to at most `max_chars` characters, appending `suffix` when cut.
pub fn truncate_chars(text: &str, max_chars: usize, suffix: &str) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], suffix),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Critical > Level::Warning);
        assert!(Level::Warning > Level::Info);
        assert_eq!(Level::Warning.to_string(), "warning");
    }

    #[test]
    fn test_finding_type_serialization() {
        let json = serde_json::to_string(&FindingType::LockAccumulation).unwrap();
        assert_eq!(json, "\"lock_accumulation\"");
        assert_eq!(FindingType::SlowOperation.title(), "SLOW OPERATION");
    }

    #[test]
    fn test_threshold_ordering() {
        assert!(ThresholdSet::new(Some(1), Some(2), Some(3)).is_ordered());
        assert!(ThresholdSet::new(None, Some(500), Some(2000)).is_ordered());
        assert!(!ThresholdSet::new(Some(10), None, Some(5)).is_ordered());
        assert_eq!(ThresholdSet::new(None, Some(500), Some(2000)).lowest_floor(), Some(500));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("abcdef", 3, "..."), "abc...");
        assert_eq!(truncate_chars("abc", 3, "..."), "abc");
        // multi-byte characters must not be split
        assert_eq!(truncate_chars("차단된쿼리", 2, ""), "차단");
    }

    #[test]
    fn test_blank_query_text_is_dropped() {
        let finding = Finding::new(FindingType::HighCpu, Level::Info, "cpu").with_query_text(Some("   "));
        assert!(finding.query_text.is_none());
    }
}
