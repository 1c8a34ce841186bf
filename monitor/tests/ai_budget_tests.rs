//! AI analysis budget, caching and attachment to dispatched findings

mod mocks;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use dbsentinel_monitor::ai::{CostSettings, EngineSettings, MemoryCache};
use dbsentinel_monitor::model::FindingMetrics;
use dbsentinel_monitor::{AnalysisEngine, CheckQuery, CostTracker, Finding, FindingType, Level};

use mocks::{build_monitor, running_op, test_config, MockProvider};

fn cost_settings(max_calls: u32) -> CostSettings {
    CostSettings {
        max_cost_per_window: 1.0,
        max_calls_per_window: max_calls,
        window: Duration::hours(1),
        alert_fraction: 0.8,
        pricing: HashMap::new(),
    }
}

fn engine_with(provider: Arc<MockProvider>, cost: Arc<CostTracker>) -> AnalysisEngine {
    AnalysisEngine::new(
        provider,
        Arc::new(MemoryCache::new()),
        cost,
        EngineSettings {
            on_level: vec![Level::Critical],
            min_execution_time_ms: 5000,
            root_cause: true,
            optimization: false,
            cache_ttl: std::time::Duration::from_secs(3600),
        },
    )
}

fn slow_finding(query: &str) -> Finding {
    Finding::new(FindingType::SlowOperation, Level::Critical, "Session 51 has been running for 20.0s")
        .with_metrics(FindingMetrics {
            execution_time_ms: Some(20_000),
            ..FindingMetrics::default()
        })
        .with_query_text(Some(query))
}

#[tokio::test]
async fn test_budget_caps_analyses_across_ticks() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;

    let provider = Arc::new(MockProvider::new(400));
    let cost = Arc::new(CostTracker::new(cost_settings(2)));
    let t = build_monitor(config, engine_with(provider.clone(), cost.clone()));

    let start = Utc::now();
    for (i, table) in ["orders", "customers", "invoices"].iter().enumerate() {
        t.source.set_rows(
            CheckQuery::RunningOperations,
            vec![running_op(51, 20_000, &format!("SELECT * FROM {}", table))],
        );
        // far enough apart that throttling never hides a delivery
        t.monitor
            .run_tick_at(start + Duration::minutes(11 * i as i64))
            .await;
    }

    let delivered = t.channel.delivered();
    assert_eq!(delivered.len(), 3);
    assert!(delivered[0].analysis.is_some());
    assert!(delivered[1].analysis.is_some());
    assert!(delivered[2].analysis.is_none());

    assert_eq!(provider.calls(), 2);
    let stats = cost.stats();
    assert_eq!(stats.window_calls, 2);
    assert_eq!(stats.lifetime_tokens, 800);
}

#[tokio::test]
async fn test_literal_variants_hit_the_cache() {
    let provider = Arc::new(MockProvider::new(400));
    let cost = Arc::new(CostTracker::new(cost_settings(10)));
    let engine = engine_with(provider.clone(), cost.clone());

    let first = engine
        .analyze(&slow_finding("SELECT * FROM orders WHERE id = 42"))
        .await
        .unwrap();
    let second = engine
        .analyze(&slow_finding("select *  from orders\n where id = 7"))
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.root_cause, first.root_cause);
    assert_eq!(provider.calls(), 1);
    assert_eq!(cost.stats().lifetime_calls, 1);

    let stats = engine.stats();
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

#[test]
fn test_window_resets_exactly_at_boundary() {
    let t0 = Utc::now();
    let cost = CostTracker::new_at(cost_settings(1), t0);

    cost.try_acquire_at(t0).unwrap().commit(400, "claude-3-haiku-20240307");
    assert!(cost.try_acquire_at(t0 + Duration::minutes(30)).is_none());

    let boundary = t0 + Duration::hours(1);
    assert!(!cost.check_reset_at(boundary - Duration::seconds(1)));
    assert!(cost.check_reset_at(boundary));
    assert_eq!(cost.stats().window_calls, 0);
    assert_eq!(cost.stats().lifetime_calls, 1);

    assert!(cost.try_acquire_at(boundary).is_some());
}

#[tokio::test]
async fn test_concurrent_analyses_share_one_budget() {
    let provider = Arc::new(MockProvider::new(400));
    let cost = Arc::new(CostTracker::new(cost_settings(1)));
    let engine = engine_with(provider.clone(), cost.clone());

    let a = slow_finding("SELECT * FROM orders");
    let b = slow_finding("SELECT * FROM customers");
    let (ra, rb) = tokio::join!(engine.analyze(&a), engine.analyze(&b));

    assert_eq!(ra.is_some() as usize + rb.is_some() as usize, 1);
    assert_eq!(provider.calls(), 1);
    assert_eq!(cost.stats().window_calls, 1);
}

#[tokio::test]
async fn test_provider_failure_leaves_budget_untouched() {
    let provider = Arc::new(MockProvider::failing());
    let cost = Arc::new(CostTracker::new(cost_settings(1)));
    let engine = engine_with(provider.clone(), cost.clone());

    assert!(engine.analyze(&slow_finding("SELECT * FROM orders")).await.is_none());
    assert!(engine.analyze(&slow_finding("SELECT * FROM orders")).await.is_none());

    // both attempts reached the provider, so the first permit was released
    assert_eq!(provider.calls(), 2);
    let stats = cost.stats();
    assert_eq!(stats.window_calls, 0);
    assert_eq!(stats.lifetime_calls, 0);
    assert!(cost.can_make_call());
}

#[tokio::test]
async fn test_warning_findings_are_not_analyzed() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;

    let provider = Arc::new(MockProvider::new(400));
    let cost = Arc::new(CostTracker::new(cost_settings(5)));
    let t = build_monitor(config, engine_with(provider.clone(), cost));

    // 6s is a warning under the default thresholds
    t.source.set_rows(
        CheckQuery::RunningOperations,
        vec![running_op(51, 6_000, "SELECT * FROM orders")],
    );
    t.monitor.run_tick().await;

    let delivered = t.channel.delivered();
    assert_eq!(delivered[0].level, Level::Warning);
    assert!(delivered[0].analysis.is_none());
    assert_eq!(provider.calls(), 0);
}
