//! Blocked/blocking pair check, feeding the lock accumulation tracker

use async_trait::async_trait;
use tracing::debug;

use super::{format_ms, Check, CheckContext};
use crate::error::SourceResult;
use crate::locks::{lock_tracker, LockConflict, SharedTracker};
use crate::model::{Finding, FindingMetrics, FindingType, Metric};
use crate::severity::classify;
use crate::source::{CheckQuery, DataSource};

pub struct BlockingCheck {
    tracker: SharedTracker,
}

impl BlockingCheck {
    pub fn new(tracker: SharedTracker) -> Self {
        Self { tracker }
    }

    fn conflict_finding(conflict: &LockConflict, ctx: &CheckContext) -> Option<Finding> {
        let thresholds = ctx.config.thresholds.for_metric(Metric::BlockingTime);
        let level = classify(conflict.wait_time_ms, &thresholds)?;

        let mut message = format!(
            "Session {} blocked by session {} for {}",
            conflict.blocked_session_id,
            conflict.blocker_session_id,
            format_ms(conflict.wait_time_ms)
        );
        if let Some(wait) = &conflict.wait_type {
            message.push_str(&format!(" ({})", wait));
        }

        Some(
            Finding::new(FindingType::Blocking, level, message)
                .at(ctx.now)
                .with_session(Some(conflict.blocked_session_id))
                .with_database(
                    conflict
                        .database
                        .clone()
                        .or_else(|| ctx.config.database.name.clone()),
                )
                .with_metrics(FindingMetrics {
                    execution_time_ms: Some(conflict.wait_time_ms),
                    wait_type: conflict.wait_type.clone(),
                    blocking_session_id: Some(conflict.blocker_session_id),
                    ..FindingMetrics::default()
                })
                .with_query_text(conflict.combined_query_text().as_deref())
                .with_lock_details(conflict.lock_details()),
        )
    }
}

#[async_trait]
impl Check for BlockingCheck {
    fn name(&self) -> &'static str {
        "blocking"
    }

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>> {
        let rows = source.run_check_query(CheckQuery::BlockingPairs).await?;
        let conflicts: Vec<LockConflict> = rows.iter().filter_map(LockConflict::from_row).collect();
        if conflicts.len() < rows.len() {
            debug!(skipped = rows.len() - conflicts.len(), "Blocking rows without session ids");
        }

        let mut findings: Vec<Finding> = conflicts
            .iter()
            .filter_map(|conflict| Self::conflict_finding(conflict, ctx))
            .collect();

        // The tracker sees the full conflict set every tick, including an
        // empty one, so resolved conflicts are pruned.
        if ctx.config.lock_monitoring.enabled {
            let escalations = lock_tracker(&self.tracker).observe(&conflicts, ctx.now);
            findings.extend(escalations.into_iter().map(|finding| {
                if finding.database.is_some() {
                    finding
                } else {
                    let database = ctx.config.database.name.clone();
                    finding.with_database(database)
                }
            }));
        }

        Ok(findings)
    }
}
