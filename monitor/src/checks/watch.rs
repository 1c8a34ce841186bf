//! Watched query check
//!
//! Running statements are matched against named watches, either by a
//! case-insensitive pattern or through the signature map, which resolves a
//! normalized statement to a watch name. A match at or above the watch's own
//! threshold is reported and counted in the per-name statistics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::warn;

use super::{format_ms, operation_metrics, Check, CheckContext};
use crate::ai::normalize_query;
use crate::config::MonitorConfig;
use crate::error::SourceResult;
use crate::model::{Finding, FindingType, Level, Metric};
use crate::severity::classify;
use crate::source::{fields, CheckQuery, DataSource};

struct Watch {
    name: String,
    pattern: Regex,
    threshold_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    count: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

/// Running statistics for one watch name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchStats {
    pub name: String,
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

pub struct WatchedQueryCheck {
    watches: Vec<Watch>,
    signatures: HashMap<String, String>,
    stats: Mutex<HashMap<String, Accumulator>>,
}

impl WatchedQueryCheck {
    pub fn from_config(config: &MonitorConfig) -> Self {
        let watches = config
            .watch_queries
            .iter()
            .filter_map(|watch| {
                match RegexBuilder::new(&watch.pattern).case_insensitive(true).build() {
                    Ok(pattern) => Some(Watch {
                        name: watch.name.clone(),
                        pattern,
                        threshold_ms: watch.threshold_ms,
                    }),
                    Err(e) => {
                        warn!(watch = %watch.name, error = %e, "Skipping watch with invalid pattern");
                        None
                    }
                }
            })
            .collect();

        let signatures = config
            .watch_signatures
            .iter()
            .map(|(text, name)| (normalize_query(text), name.clone()))
            .collect();

        Self {
            watches,
            signatures,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn watch_names(&self) -> Vec<&str> {
        self.watches.iter().map(|w| w.name.as_str()).collect()
    }

    /// Per-name statistics, slowest average first
    pub fn stats(&self) -> Vec<WatchStats> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<WatchStats> = stats
            .iter()
            .map(|(name, acc)| WatchStats {
                name: name.clone(),
                count: acc.count,
                avg_ms: if acc.count == 0 { 0 } else { acc.total_ms / acc.count },
                min_ms: acc.min_ms,
                max_ms: acc.max_ms,
            })
            .collect();
        out.sort_by(|a, b| b.avg_ms.cmp(&a.avg_ms).then_with(|| a.name.cmp(&b.name)));
        out
    }

    fn record(&self, name: &str, elapsed_ms: u64) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let acc = stats.entry(name.to_string()).or_default();
        acc.min_ms = if acc.count == 0 { elapsed_ms } else { acc.min_ms.min(elapsed_ms) };
        acc.max_ms = acc.max_ms.max(elapsed_ms);
        acc.total_ms += elapsed_ms;
        acc.count += 1;
    }
}

#[async_trait]
impl Check for WatchedQueryCheck {
    fn name(&self) -> &'static str {
        "watch_queries"
    }

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>> {
        if self.watches.is_empty() {
            return Ok(Vec::new());
        }

        let rows = source.run_check_query(CheckQuery::RunningOperations).await?;
        let thresholds = ctx.config.thresholds.for_metric(Metric::ExecutionTime);
        let mut findings = Vec::new();

        for row in &rows {
            let (Some(text), Some(elapsed)) = (row.str(fields::TEXT), row.u64(fields::ELAPSED_MS)) else {
                continue;
            };
            let signature_name = self.signatures.get(&normalize_query(text));

            for watch in &self.watches {
                let matched = watch.pattern.is_match(text) || signature_name == Some(&watch.name);
                if !matched || elapsed < watch.threshold_ms {
                    continue;
                }

                self.record(&watch.name, elapsed);

                // Past its own threshold a watch is at least a warning; the
                // execution tiers can raise it to critical.
                let level = classify(elapsed, &thresholds)
                    .map_or(Level::Warning, |level| level.max(Level::Warning));
                let message = format!(
                    "Watched query '{}' running for {} (threshold {})",
                    watch.name,
                    format_ms(elapsed),
                    format_ms(watch.threshold_ms)
                );
                findings.push(
                    Finding::new(FindingType::WatchQuery, level, message)
                        .at(ctx.now)
                        .with_session(row.i64(fields::SESSION_ID))
                        .with_database(ctx.database_for(row))
                        .with_metrics(operation_metrics(row))
                        .with_query_text(Some(text))
                        .with_query_name(watch.name.clone()),
                );
            }
        }

        Ok(findings)
    }
}
