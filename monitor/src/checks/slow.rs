//! Long-running operation check

use async_trait::async_trait;

use super::{format_ms, operation_metrics, plan_summary, Check, CheckContext};
use crate::error::SourceResult;
use crate::model::{Finding, FindingType, Metric};
use crate::severity::classify;
use crate::source::{fields, CheckQuery, DataSource};

/// Top-N running operations by elapsed time, tiered by execution thresholds
#[derive(Debug, Default)]
pub struct SlowOperationCheck;

impl SlowOperationCheck {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Check for SlowOperationCheck {
    fn name(&self) -> &'static str {
        "slow_operations"
    }

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>> {
        let mut rows = source.run_check_query(CheckQuery::RunningOperations).await?;
        rows.sort_by_key(|row| std::cmp::Reverse(row.u64(fields::ELAPSED_MS).unwrap_or(0)));

        let thresholds = ctx.config.thresholds.for_metric(Metric::ExecutionTime);
        let findings = rows
            .iter()
            .take(ctx.config.monitoring.top_n)
            .filter_map(|row| {
                let elapsed = row.u64(fields::ELAPSED_MS)?;
                let level = classify(elapsed, &thresholds)?;
                let session = row.i64(fields::SESSION_ID);
                let message = match session {
                    Some(id) => format!("Session {} has been running for {}", id, format_ms(elapsed)),
                    None => format!("Operation has been running for {}", format_ms(elapsed)),
                };

                Some(
                    Finding::new(FindingType::SlowOperation, level, message)
                        .at(ctx.now)
                        .with_session(session)
                        .with_database(ctx.database_for(row))
                        .with_metrics(operation_metrics(row))
                        .with_query_text(row.str(fields::TEXT))
                        .with_plan(plan_summary(row)),
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

    fn context(config: MonitorConfig) -> CheckContext {
        CheckContext::new(Arc::new(config), Utc::now())
    }

    fn op(session: i64, elapsed: u64) -> Row {
        Row::from_json(json!({
            "sessionId": session,
            "elapsedMs": elapsed,
            "cpuMs": elapsed / 2,
            "text": format!("SELECT * FROM orders WHERE id = {}", session),
        }))
    }

    #[tokio::test]
    async fn test_classifies_by_elapsed_time() {
        let mut config = MonitorConfig::default();
        config.thresholds.info.execution_time_ms = None;
        config.thresholds.warning.execution_time_ms = Some(500);
        config.thresholds.critical.execution_time_ms = Some(2000);

        let source = MemorySource::new();
        source.set_rows(
            CheckQuery::RunningOperations,
            vec![op(51, 2500), op(52, 600), op(53, 100)],
        );

        let findings = SlowOperationCheck::new().run(&source, &context(config)).await.unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].level, Level::Critical);
        assert_eq!(findings[0].session_id, Some(51));
        assert_eq!(findings[1].level, Level::Warning);
        assert_eq!(findings[1].metrics.cpu_time_ms, Some(300));
    }

    #[tokio::test]
    async fn test_only_top_n_are_considered() {
        let mut config = MonitorConfig::default();
        config.monitoring.top_n = 2;

        let source = MemorySource::new();
        source.set_rows(
            CheckQuery::RunningOperations,
            vec![op(1, 12_000), op(2, 15_000), op(3, 11_000)],
        );

        let findings = SlowOperationCheck::new().run(&source, &context(config)).await.unwrap();
        let sessions: Vec<_> = findings.iter().map(|f| f.session_id).collect();
        assert_eq!(sessions, vec![Some(2), Some(1)]);
    }

    #[tokio::test]
    async fn test_plan_and_database_are_attached() {
        let mut config = MonitorConfig::default();
        config.database.name = Some("inventory".to_string());

        let source = MemorySource::new();
        source.set_rows(
            CheckQuery::RunningOperations,
            vec![op(7, 4000).with(fields::TABLE_SCANS, 3).with(fields::INDEX_SEEKS, 1)],
        );

        let findings = SlowOperationCheck::new().run(&source, &context(config)).await.unwrap();
        let finding = &findings[0];
        assert_eq!(finding.database.as_deref(), Some("inventory"));
        let plan = finding.execution_plan_summary.as_ref().unwrap();
        assert_eq!(plan.table_scans, 3);
        assert_eq!(plan.index_seeks, 1);
        assert!(finding.message.contains("4.0s"));
    }

    #[tokio::test]
    async fn test_query_failure_propagates() {
        let source = MemorySource::new();
        source.push_failure(CheckQuery::RunningOperations, "deadlock victim");
        let result = SlowOperationCheck::new()
            .run(&source, &context(MonitorConfig::default()))
            .await;
        assert!(result.is_err());
    }
}
