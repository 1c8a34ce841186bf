//! Unused index check

use async_trait::async_trait;

use super::{Check, CheckContext};
use crate::error::SourceResult;
use crate::model::{Finding, FindingType, IndexDetails, Level};
use crate::source::{fields, CheckQuery, DataSource};

/// Indexes that are maintained on write but never read are removal candidates
#[derive(Debug, Default)]
pub struct IndexUsageCheck;

impl IndexUsageCheck {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Check for IndexUsageCheck {
    fn name(&self) -> &'static str {
        "unused_indexes"
    }

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>> {
        let rows = source.run_check_query(CheckQuery::UnusedIndexes).await?;

        let findings = rows
            .iter()
            .filter_map(|row| {
                let details = IndexDetails {
                    table_name: row.text(fields::TABLE_NAME)?,
                    index_name: row.text(fields::INDEX_NAME)?,
                    reads: row.u64(fields::READS).unwrap_or(0),
                    writes: row.u64(fields::WRITES).unwrap_or(0),
                };
                if details.reads != 0 || details.writes == 0 {
                    return None;
                }

                let message = format!(
                    "Index {} on {} has {} writes and no reads; candidate for removal",
                    details.index_name, details.table_name, details.writes
                );
                Some(
                    Finding::new(FindingType::UnusedIndex, Level::Info, message)
                        .at(ctx.now)
                        .with_database(ctx.database_for(row))
                        .with_index_details(details),
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
    use crate::source::{MemorySource, Row};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_only_indexes_are_reported() {
        let source = MemorySource::new();
        source.set_rows(
            CheckQuery::UnusedIndexes,
            vec![
                Row::from_json(json!({"tableName": "orders", "indexName": "ix_orders_note", "reads": 0, "writes": 420})),
                Row::from_json(json!({"tableName": "orders", "indexName": "ix_orders_date", "reads": 15, "writes": 420})),
                Row::from_json(json!({"tableName": "archive", "indexName": "ix_archive_id", "reads": 0, "writes": 0})),
                Row::from_json(json!({"indexName": "orphan", "reads": 0, "writes": 3})),
            ],
        );
        let ctx = CheckContext::new(Arc::new(MonitorConfig::default()), Utc::now());

        let findings = IndexUsageCheck::new().run(&source, &ctx).await.unwrap();
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.level, Level::Info);
        assert_eq!(finding.index_details.as_ref().unwrap().index_name, "ix_orders_note");
        assert!(finding.message.contains("candidate for removal"));
    }
}
