//! Check modules
//!
//! Each check asks the data source for one named introspection query and turns
//! the returned rows into findings. Threshold-tiered checks classify through
//! [`crate::severity::classify`]; the index and cache checks own fixed rules.

mod blocking;
mod cache_hit;
mod index;
mod resource;
mod slow;
mod watch;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::MonitorConfig;
use crate::error::SourceResult;
use crate::locks::SharedTracker;
use crate::model::{ExecutionPlanSummary, Finding, FindingMetrics};
use crate::source::{fields, DataSource, Row};

pub use blocking::BlockingCheck;
pub use cache_hit::CacheHitCheck;
pub use index::IndexUsageCheck;
pub use resource::ResourceCheck;
pub use slow::SlowOperationCheck;
pub use watch::{WatchStats, WatchedQueryCheck};

/// Per-tick inputs shared by every check
#[derive(Clone)]
pub struct CheckContext {
    pub config: Arc<MonitorConfig>,
    /// Tick timestamp stamped onto every finding
    pub now: DateTime<Utc>,
}

impl CheckContext {
    pub fn new(config: Arc<MonitorConfig>, now: DateTime<Utc>) -> Self {
        Self { config, now }
    }

    /// Database named by the row, falling back to the configured one
    pub fn database_for(&self, row: &Row) -> Option<String> {
        row.text(fields::DATABASE)
            .or_else(|| self.config.database.name.clone())
    }
}

/// One anomaly category
#[async_trait]
pub trait Check: Send + Sync {
    /// Stable name used in logs
    fn name(&self) -> &'static str;

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>>;
}

/// Checks enabled by configuration, in execution order
pub struct CheckSet {
    pub checks: Vec<Arc<dyn Check>>,
    /// Kept separately so its statistics can be reported at shutdown
    pub watcher: Option<Arc<WatchedQueryCheck>>,
}

impl CheckSet {
    pub fn from_config(config: &MonitorConfig, tracker: SharedTracker) -> Self {
        let enabled = &config.monitoring.enabled_checks;
        let mut checks: Vec<Arc<dyn Check>> = Vec::new();
        let mut watcher = None;

        if enabled.slow_queries {
            checks.push(Arc::new(SlowOperationCheck::new()));
        }
        if enabled.blocking {
            checks.push(Arc::new(BlockingCheck::new(tracker)));
        }
        if enabled.high_cpu {
            checks.push(Arc::new(ResourceCheck::new()));
        }
        if enabled.watch_queries {
            let check = Arc::new(WatchedQueryCheck::from_config(config));
            checks.push(check.clone());
            watcher = Some(check);
        }
        if enabled.unused_indexes {
            checks.push(Arc::new(IndexUsageCheck::new()));
        }
        if enabled.cache_hit {
            checks.push(Arc::new(CacheHitCheck::new()));
        }

        Self { checks, watcher }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// Measurements common to every running-operation row
pub(crate) fn operation_metrics(row: &Row) -> FindingMetrics {
    FindingMetrics {
        execution_time_ms: row.u64(fields::ELAPSED_MS),
        cpu_time_ms: row.u64(fields::CPU_MS),
        logical_reads: row.u64(fields::LOGICAL_READS),
        wait_type: row.text(fields::WAIT_TYPE).filter(|w| !w.is_empty()),
        blocking_session_id: row.i64(fields::BLOCKING_SESSION_ID).filter(|id| *id != 0),
    }
}

/// Plan operator counts, present only when the row carries any of them
pub(crate) fn plan_summary(row: &Row) -> Option<ExecutionPlanSummary> {
    let table_scans = row.u64(fields::TABLE_SCANS);
    let index_scans = row.u64(fields::INDEX_SCANS);
    let index_seeks = row.u64(fields::INDEX_SEEKS);
    if table_scans.is_none() && index_scans.is_none() && index_seeks.is_none() {
        return None;
    }
    Some(ExecutionPlanSummary {
        table_scans: table_scans.unwrap_or(0),
        index_scans: index_scans.unwrap_or(0),
        index_seeks: index_seeks.unwrap_or(0),
    })
}

/// `2.5s` for long durations, `850ms` otherwise
pub(crate) fn format_ms(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{LockTracker, TrackerSettings};
    use serde_json::json;
    use std::sync::Mutex;

    fn tracker(config: &MonitorConfig) -> SharedTracker {
        Arc::new(Mutex::new(LockTracker::new(TrackerSettings::from(&config.lock_monitoring))))
    }

    #[test]
    fn test_default_check_set() {
        let config = MonitorConfig::default();
        let set = CheckSet::from_config(&config, tracker(&config));
        assert_eq!(set.names(), vec!["slow_operations", "blocking", "high_cpu"]);
        assert!(set.watcher.is_none());
    }

    #[test]
    fn test_all_checks_enabled() {
        let mut config = MonitorConfig::default();
        let enabled = &mut config.monitoring.enabled_checks;
        enabled.watch_queries = true;
        enabled.unused_indexes = true;
        enabled.cache_hit = true;

        let set = CheckSet::from_config(&config, tracker(&config));
        assert_eq!(set.len(), 6);
        assert!(set.watcher.is_some());
    }

    #[test]
    fn test_plan_summary_only_when_present() {
        let bare = Row::from_json(json!({"sessionId": 1, "elapsedMs": 10}));
        assert!(plan_summary(&bare).is_none());

        let planned = bare.with(fields::TABLE_SCANS, 2);
        assert_eq!(
            plan_summary(&planned),
            Some(ExecutionPlanSummary {
                table_scans: 2,
                index_scans: 0,
                index_seeks: 0
            })
        );
    }

    #[test]
    fn test_zero_blocker_is_not_reported() {
        let row = Row::from_json(json!({"blockingSessionId": 0, "waitType": ""}));
        let metrics = operation_metrics(&row);
        assert_eq!(metrics.blocking_session_id, None);
        assert_eq!(metrics.wait_type, None);
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(2500), "2.5s");
        assert_eq!(format_ms(850), "850ms");
    }
}
