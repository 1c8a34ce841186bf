//! Buffer cache hit ratio check

use async_trait::async_trait;

use super::{Check, CheckContext};
use crate::error::SourceResult;
use crate::model::{CacheDetails, Finding, FindingType, Level};
use crate::source::{fields, CheckQuery, DataSource, Row};

#[derive(Debug, Default)]
pub struct CacheHitCheck;

impl CacheHitCheck {
    pub fn new() -> Self {
        Self
    }
}

/// Hit ratio in percent, from `hitRatio` or `hits / lookups`
fn hit_ratio(row: &Row) -> Option<f64> {
    if let Some(ratio) = row.f64(fields::HIT_RATIO) {
        return Some(ratio);
    }
    let hits = row.f64(fields::HITS)?;
    let lookups = row.f64(fields::LOOKUPS)?;
    if lookups <= 0.0 {
        return None;
    }
    Some(hits * 100.0 / lookups)
}

#[async_trait]
impl Check for CacheHitCheck {
    fn name(&self) -> &'static str {
        "cache_hit"
    }

    async fn run(&self, source: &dyn DataSource, ctx: &CheckContext) -> SourceResult<Vec<Finding>> {
        let floor = ctx.config.cache_hit.min_ratio_percent;
        let rows = source.run_check_query(CheckQuery::BufferCacheStats).await?;

        let findings = rows
            .iter()
            .filter_map(|row| {
                let ratio = hit_ratio(row)?;
                if ratio >= floor {
                    return None;
                }
                Some(
                    Finding::new(
                        FindingType::LowCacheHit,
                        Level::Warning,
                        format!("Buffer cache hit ratio {:.1}% is below {:.1}%", ratio, floor),
                    )
                    .at(ctx.now)
                    .with_database(ctx.database_for(row))
                    .with_cache_details(CacheDetails {
                        hit_ratio_percent: ratio,
                        floor_percent: floor,
                    }),
                )
            })
            .collect();

        Ok(findings)
    }
}
