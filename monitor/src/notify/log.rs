//! Daily alert log
//!
//! One file per UTC day, `db-alert-YYYY-MM-DD.json`, holding a JSON array that
//! only ever grows. Appends are serialized through an async mutex because each
//! append rewrites the whole array.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ai::Analysis;
use crate::config::{DatabaseConfig, LoggingConfig};
use crate::error::{NotifyError, NotifyResult};
use crate::model::{
    truncate_chars, CacheDetails, ExecutionPlanSummary, Finding, FindingType, IndexDetails, Level,
    LockDetails,
};

pub const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

const TRUNCATION_SUFFIX: &str = "... (truncated)";

static LOG_FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^db-alert-(\d{4}-\d{2}-\d{2})\.json(\.backup)?$").expect("valid log name pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertDetails {
    pub session_id: Option<i64>,
    pub database: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub logical_reads: Option<u64>,
    pub blocking_session_id: Option<i64>,
    pub wait_type: Option<String>,
    pub query_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<ExecutionPlanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_details: Option<LockDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_details: Option<IndexDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_details: Option<CacheDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertMetadata {
    pub database: Option<String>,
    pub server: Option<String>,
    pub monitor_version: String,
}

/// One element of the daily log array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub alert_type: FindingType,
    pub message: String,
    #[serde(default)]
    pub details: AlertDetails,
    #[serde(default)]
    pub metadata: AlertMetadata,
}

/// Aggregates over one day's log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: Option<NaiveDate>,
    pub total: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub avg_execution_time_ms: f64,
    pub max_execution_time_ms: u64,
    pub slowest_query: Option<String>,
}

pub struct AlertLog {
    directory: PathBuf,
    retention_days: u32,
    max_query_text_length: usize,
    database: Option<String>,
    server: Option<String>,
    write_lock: Mutex<()>,
}

impl AlertLog {
    pub fn new(config: &LoggingConfig, database: &DatabaseConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            retention_days: config.retention_days,
            max_query_text_length: config.max_query_text_length,
            database: database.name.clone(),
            server: database.server.clone(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory
            .join(format!("db-alert-{}.json", date.format("%Y-%m-%d")))
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    pub fn entry_for(&self, finding: &Finding) -> AlertLogEntry {
        let query_text = finding
            .query_text
            .as_deref()
            .map(|q| truncate_chars(q, self.max_query_text_length, TRUNCATION_SUFFIX));

        AlertLogEntry {
            timestamp: finding.timestamp,
            level: finding.level,
            alert_type: finding.finding_type,
            message: finding.message.clone(),
            details: AlertDetails {
                session_id: finding.session_id,
                database: finding.database.clone(),
                execution_time_ms: finding.metrics.execution_time_ms,
                cpu_time_ms: finding.metrics.cpu_time_ms,
                logical_reads: finding.metrics.logical_reads,
                blocking_session_id: finding.metrics.blocking_session_id,
                wait_type: finding.metrics.wait_type.clone(),
                query_text,
                query_name: finding.query_name.clone(),
                execution_plan: finding.execution_plan_summary.clone(),
                lock_details: finding.lock_details.clone(),
                index_details: finding.index_details.clone(),
                cache_details: finding.cache_details.clone(),
                analysis: finding.analysis.clone(),
            },
            metadata: AlertMetadata {
                database: self.database.clone(),
                server: self.server.clone(),
                monitor_version: MONITOR_VERSION.to_string(),
            },
        }
    }

    /// Append a finding to its day's file, falling back to a `.backup` file
    pub async fn append(&self, finding: &Finding) -> NotifyResult<PathBuf> {
        let entry = serde_json::to_value(self.entry_for(finding)).map_err(|e| {
            NotifyError::LogWriteFailed {
                reason: e.to_string(),
            }
        })?;
        let path = self.path_for(finding.timestamp.date_naive());

        let _guard = self.write_lock.lock().await;
        match self.append_to_array(&path, entry.clone()).await {
            Ok(()) => Ok(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Alert log write failed, using backup");
                let backup = Self::backup_path(&path);
                self.append_line(&backup, &entry).await.map_err(|backup_err| {
                    NotifyError::LogWriteFailed {
                        reason: format!("{}; backup also failed: {}", e, backup_err),
                    }
                })?;
                Ok(backup)
            }
        }
    }

    async fn append_to_array(&self, path: &Path, entry: Value) -> std::io::Result<()> {
        fs::create_dir_all(&self.directory).await?;

        let mut entries: Vec<Value> = match fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    let corrupt = path.with_extension("json.corrupt");
                    warn!(path = %path.display(), error = %e, "Alert log unreadable, starting a new one");
                    fs::rename(path, &corrupt).await?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        entries.push(entry);
        let content = serde_json::to_vec_pretty(&entries)?;
        fs::write(path, content).await
    }

    async fn append_line(&self, path: &Path, entry: &Value) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await
    }

    /// Entries logged on `date`; a missing file is an empty day
    pub async fn read_day(&self, date: NaiveDate) -> NotifyResult<Vec<AlertLogEntry>> {
        let path = self.path_for(date);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(NotifyError::LogWriteFailed {
                    reason: format!("reading {}: {}", path.display(), e),
                })
            }
        };
        serde_json::from_str(&content).map_err(|e| NotifyError::LogWriteFailed {
            reason: format!("parsing {}: {}", path.display(), e),
        })
    }

    pub async fn daily_stats(&self, date: NaiveDate) -> NotifyResult<DailyStats> {
        let entries = self.read_day(date).await?;
        let mut stats = DailyStats {
            date: Some(date),
            total: entries.len(),
            ..DailyStats::default()
        };

        let mut exec_sum = 0u64;
        let mut exec_count = 0u64;
        for entry in &entries {
            *stats.by_level.entry(entry.level.to_string()).or_insert(0) += 1;
            *stats.by_type.entry(entry.alert_type.to_string()).or_insert(0) += 1;
            if let Some(ms) = entry.details.execution_time_ms {
                exec_sum += ms;
                exec_count += 1;
                if exec_count == 1 || ms > stats.max_execution_time_ms {
                    stats.max_execution_time_ms = ms;
                    stats.slowest_query = entry.details.query_text.clone();
                }
            }
        }
        if exec_count > 0 {
            stats.avg_execution_time_ms = exec_sum as f64 / exec_count as f64;
        }
        Ok(stats)
    }

    /// Delete day files older than the retention period
    pub async fn cleanup(&self, today: NaiveDate) -> NotifyResult<usize> {
        let cutoff = today - Duration::days(self.retention_days as i64);
        let mut dir = match fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(NotifyError::LogWriteFailed {
                    reason: e.to_string(),
                })
            }
        };

        let mut removed = 0;
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name().to_string_lossy().to_string();
            let Some(date) = LOG_FILE_NAME
                .captures(&name)
                .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date < cutoff {
                match fs::remove_file(item.path()).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(file = %name, "Removed expired alert log");
                    }
                    Err(e) => warn!(file = %name, error = %e, "Failed to remove expired alert log"),
                }
            }
        }

        if removed > 0 {
            info!(removed, retention_days = self.retention_days, "Alert log retention applied");
        }
        Ok(removed)
    }
}
