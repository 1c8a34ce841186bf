//! Data source adapter boundary
//!
//! The monitor never speaks a query language. It asks an adapter for one of a
//! fixed set of named introspection queries and receives flat rows whose field
//! names follow [`fields`].

mod command;
mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{DataSourceConfig, SourceKind};
use crate::error::SourceResult;

pub use command::CommandSource;
pub use memory::MemorySource;

/// Row field names understood by the checks
pub mod fields {
    pub const SESSION_ID: &str = "sessionId";
    pub const DATABASE: &str = "database";
    pub const TEXT: &str = "text";
    pub const ELAPSED_MS: &str = "elapsedMs";
    pub const CPU_MS: &str = "cpuMs";
    pub const LOGICAL_READS: &str = "logicalReads";
    pub const WAIT_TYPE: &str = "waitType";
    pub const BLOCKING_SESSION_ID: &str = "blockingSessionId";

    pub const TABLE_SCANS: &str = "tableScans";
    pub const INDEX_SCANS: &str = "indexScans";
    pub const INDEX_SEEKS: &str = "indexSeeks";

    pub const BLOCKED_SESSION_ID: &str = "blockedSessionId";
    pub const BLOCKER_SESSION_ID: &str = "blockerSessionId";
    pub const WAIT_TIME_MS: &str = "waitTimeMs";
    pub const BLOCKED_TEXT: &str = "blockedText";
    pub const BLOCKER_TEXT: &str = "blockerText";
    pub const RESOURCE: &str = "resource";
    pub const RESOURCE_TYPE: &str = "resourceType";
    pub const OBJECT_NAME: &str = "objectName";
    pub const BLOCKED_LOCK_MODE: &str = "blockedLockMode";
    pub const BLOCKER_LOCK_MODE: &str = "blockerLockMode";
    pub const BLOCKED_HOST: &str = "blockedHost";
    pub const BLOCKER_HOST: &str = "blockerHost";
    pub const BLOCKED_PROGRAM: &str = "blockedProgram";
    pub const BLOCKER_PROGRAM: &str = "blockerProgram";

    pub const TABLE_NAME: &str = "tableName";
    pub const INDEX_NAME: &str = "indexName";
    pub const READS: &str = "reads";
    pub const WRITES: &str = "writes";

    pub const HIT_RATIO: &str = "hitRatio";
    pub const HITS: &str = "hits";
    pub const LOOKUPS: &str = "lookups";
}

/// Named introspection query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckQuery {
    RunningOperations,
    BlockingPairs,
    HighCpuOperations,
    UnusedIndexes,
    BufferCacheStats,
}

impl CheckQuery {
    /// Stable wire id
    pub fn id(&self) -> &'static str {
        match self {
            CheckQuery::RunningOperations => "runningOperations",
            CheckQuery::BlockingPairs => "blockingPairs",
            CheckQuery::HighCpuOperations => "highCpuOperations",
            CheckQuery::UnusedIndexes => "unusedIndexes",
            CheckQuery::BufferCacheStats => "bufferCacheStats",
        }
    }
}

impl fmt::Display for CheckQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// One flat result record
///
/// Numeric accessors accept numbers and numeric strings; anything else reads
/// as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from a JSON object; other values produce an empty row
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Row(map),
            _ => Row::default(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// String value, rendering numbers as text
    pub fn text(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn i64(&self, field: &str) -> Option<i64> {
        match self.get(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
            }
            _ => None,
        }
    }

    /// Non-negative integer; negative values read as absent
    pub fn u64(&self, field: &str) -> Option<u64> {
        match self.get(field)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && *f >= 0.0)
                        .map(|f| f as u64)
                })
            }
            _ => None,
        }
    }

    pub fn f64(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Adapter that executes named introspection queries
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Establish the connection; failure here is fatal at startup
    async fn connect(&self) -> SourceResult<()>;

    async fn run_check_query(&self, query: CheckQuery) -> SourceResult<Vec<Row>>;

    async fn close(&self) -> SourceResult<()>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Build the adapter selected by configuration
pub fn build_source(config: &DataSourceConfig) -> Arc<dyn DataSource> {
    match config.kind {
        SourceKind::Command => Arc::new(CommandSource::new(
            config.program.clone(),
            config.args.clone(),
            std::time::Duration::from_secs(config.timeout_seconds),
        )),
    }
}

/// Rows grouped by query, used by scripted sources
pub type RowScript = HashMap<CheckQuery, Vec<Row>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_accessors_tolerate_strings() {
        let row = Row::from_json(json!({
            "sessionId": "52",
            "elapsedMs": 2500.7,
            "cpuMs": -4,
            "waitType": "LCK_M_X",
            "hitRatio": "87.5",
            "blockingSessionId": null
        }));

        assert_eq!(row.i64(fields::SESSION_ID), Some(52));
        assert_eq!(row.u64(fields::ELAPSED_MS), Some(2500));
        assert_eq!(row.u64(fields::CPU_MS), None);
        assert_eq!(row.str(fields::WAIT_TYPE), Some("LCK_M_X"));
        assert_eq!(row.f64(fields::HIT_RATIO), Some(87.5));
        assert_eq!(row.i64(fields::BLOCKING_SESSION_ID), None);
        assert_eq!(row.text(fields::SESSION_ID), Some("52".to_string()));
    }

    #[test]
    fn test_string_decimals_read_like_numbers() {
        let row = Row::from_json(json!({
            "elapsedMs": "1234.5",
            "logicalReads": " 88 ",
            "cpuMs": "-3.5",
            "sessionId": "61.0",
            "waitType": "n/a"
        }));

        assert_eq!(row.u64(fields::ELAPSED_MS), Some(1234));
        assert_eq!(row.u64(fields::LOGICAL_READS), Some(88));
        assert_eq!(row.u64(fields::CPU_MS), None);
        assert_eq!(row.i64(fields::CPU_MS), Some(-3));
        assert_eq!(row.i64(fields::SESSION_ID), Some(61));
        assert_eq!(row.u64(fields::WAIT_TYPE), None);
    }

    #[test]
    fn test_check_query_ids() {
        assert_eq!(CheckQuery::BlockingPairs.id(), "blockingPairs");
        let json = serde_json::to_string(&CheckQuery::BufferCacheStats).unwrap();
        assert_eq!(json, "\"bufferCacheStats\"");
    }

    #[test]
    fn test_non_object_row_is_empty() {
        assert_eq!(Row::from_json(json!([1, 2])), Row::new());
    }
}
