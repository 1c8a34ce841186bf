//! CPU pressure check

use async_trait::async_trait;

use super::{format_ms, operation_metrics, Check, CheckContext};
use crate::error::SourceResult;
use crate::model::{Finding, FindingType, Metric};
use crate::severity::classify;
use crate::source::{fields, CheckQuery, DataSource};

/// Highest-CPU operations, tiered by CPU thresholds
#[derive(Debug, Default)]
pub struct ResourceCheck;

impl ResourceCheck {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Check for ResourceCheck {
    fn name(&self) -> &'static str {
        "high_cpu"
    }

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>> {
        let thresholds = ctx.config.thresholds.for_metric(Metric::CpuTime);
        let Some(floor) = thresholds.lowest_floor() else {
            return Ok(Vec::new());
        };

        let rows = source.run_check_query(CheckQuery::HighCpuOperations).await?;
        let mut candidates: Vec<(u64, _)> = rows
            .iter()
            .filter_map(|row| row.u64(fields::CPU_MS).map(|cpu| (cpu, row)))
            .filter(|(cpu, _)| *cpu >= floor)
            .collect();
        candidates.sort_by_key(|(cpu, _)| std::cmp::Reverse(*cpu));

        let findings = candidates
            .into_iter()
            .take(ctx.config.monitoring.top_n)
            .filter_map(|(cpu, row)| {
                let level = classify(cpu, &thresholds)?;
                let session = row.i64(fields::SESSION_ID);
                Some(
                    Finding::new(FindingType::HighCpu, level, format!("High CPU usage: {} of CPU time", format_ms(cpu)))
                        .at(ctx.now)
                        .with_session(session)
                        .with_database(ctx.database_for(row))
                        .with_metrics(operation_metrics(row))
                        .with_query_text(row.str(fields::TEXT)),
                )
            })
            .collect();

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::model::Level;
    use crate::source::{MemorySource, Row};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn op(session: i64, cpu: u64) -> Row {
        Row::from_json(json!({"sessionId": session, "cpuMs": cpu, "elapsedMs": cpu + 100}))
    }

    #[tokio::test]
    async fn test_cpu_tiers_and_prefilter() {
        let source = MemorySource::new();
        source.set_rows(
            CheckQuery::HighCpuOperations,
            vec![op(1, 100), op(2, 6_000), op(3, 2_500), op(4, 700)],
        );
        let ctx = CheckContext::new(Arc::new(MonitorConfig::default()), Utc::now());

        let findings = ResourceCheck::new().run(&source, &ctx).await.unwrap();
        let levels: Vec<_> = findings.iter().map(|f| (f.session_id, f.level)).collect();
        assert_eq!(
            levels,
            vec![
                (Some(2), Level::Critical),
                (Some(3), Level::Warning),
                (Some(4), Level::Info)
            ]
        );
        assert_eq!(findings[0].metrics.execution_time_ms, Some(6_100));
    }

    #[tokio::test]
    async fn test_no_cpu_thresholds_skips_query() {
        let mut config = MonitorConfig::default();
        config.thresholds.info.cpu_time_ms = None;
        config.thresholds.warning.cpu_time_ms = None;
        config.thresholds.critical.cpu_time_ms = None;

        let source = MemorySource::new();
        let ctx = CheckContext::new(Arc::new(config), Utc::now());
        assert!(ResourceCheck::new().run(&source, &ctx).await.unwrap().is_empty());
        assert_eq!(source.calls(CheckQuery::HighCpuOperations), 0);
    }
}
