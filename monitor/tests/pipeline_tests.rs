//! End-to-end tick pipeline: checks, classification, alert log and throttling

mod mocks;

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use dbsentinel_monitor::notify::AlertLog;
use dbsentinel_monitor::source::fields;
use dbsentinel_monitor::{AnalysisEngine, CheckQuery, FindingType, Level, MemorySource, Row};

use mocks::{blocking_pair, build_monitor, build_monitor_with_source, running_op, test_config};

#[tokio::test]
async fn test_execution_time_tiers() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;
    config.thresholds.info.execution_time_ms = None;
    config.thresholds.warning.execution_time_ms = Some(500);
    config.thresholds.critical.execution_time_ms = Some(2000);

    let t = build_monitor(config, AnalysisEngine::disabled());
    t.source.set_rows(
        CheckQuery::RunningOperations,
        vec![
            running_op(51, 2500, "SELECT * FROM orders"),
            running_op(52, 600, "SELECT * FROM customers"),
            running_op(53, 100, "SELECT 1"),
        ],
    );

    let report = t.monitor.run_tick().await;
    assert_eq!(
        report.findings,
        vec![
            (FindingType::SlowOperation, Level::Critical),
            (FindingType::SlowOperation, Level::Warning),
        ]
    );
}

#[tokio::test]
async fn test_throttle_window_per_identity() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;
    config.notifications.throttle_minutes = 10;

    let t = build_monitor(config, AnalysisEngine::disabled());
    t.source.set_rows(
        CheckQuery::RunningOperations,
        vec![running_op(51, 15_000, "SELECT * FROM orders")],
    );

    let start = Utc::now();
    t.monitor.run_tick_at(start).await;
    let second = t.monitor.run_tick_at(start + Duration::minutes(3)).await;
    assert_eq!(second.suppressed, 1);
    assert_eq!(t.channel.delivered().len(), 1);

    let third = t.monitor.run_tick_at(start + Duration::minutes(11)).await;
    assert_eq!(third.delivered, 1);
    assert_eq!(t.channel.delivered().len(), 2);

    // every finding still counts, throttled or not
    assert_eq!(t.monitor.dispatcher().level_count(Level::Critical), 3);
}

#[tokio::test]
async fn test_alert_log_records_every_finding() {
    let (mut config, dir) = test_config();
    config.database.name = Some("inventory".to_string());
    config.database.server = Some("db-primary".to_string());
    config.logging.max_query_text_length = 20;
    config.monitoring.enabled_checks.unused_indexes = true;
    config.monitoring.enabled_checks.cache_hit = true;

    let log = AlertLog::new(&config.logging, &config.database);
    let t = build_monitor(config, AnalysisEngine::disabled());
    t.source.set_rows(
        CheckQuery::RunningOperations,
        vec![running_op(51, 12_000, "SELECT o.id, o.total FROM orders o JOIN customers c ON c.id = o.customer_id")],
    );
    t.source.set_rows(CheckQuery::BlockingPairs, vec![blocking_pair(72, 51, 40_000)]);
    t.source.set_rows(
        CheckQuery::UnusedIndexes,
        vec![Row::new()
            .with(fields::TABLE_NAME, "orders")
            .with(fields::INDEX_NAME, "ix_orders_note")
            .with(fields::READS, 0)
            .with(fields::WRITES, 900)],
    );
    t.source.set_rows(CheckQuery::BufferCacheStats, vec![Row::new().with(fields::HIT_RATIO, 71.0)]);

    let now = Utc::now();
    let report = t.monitor.run_tick_at(now).await;
    assert_eq!(report.findings.len(), 4);

    let entries = log.read_day(now.date_naive()).await.unwrap();
    assert_eq!(entries.len(), 4);
    let slow = entries
        .iter()
        .find(|e| e.alert_type == FindingType::SlowOperation)
        .unwrap();
    assert!(slow.details.query_text.as_deref().unwrap().ends_with("... (truncated)"));
    assert_eq!(slow.metadata.server.as_deref(), Some("db-primary"));
    assert_eq!(slow.details.database.as_deref(), Some("inventory"));

    let raw = std::fs::read_to_string(log.path_for(now.date_naive())).unwrap();
    assert!(raw.contains("\"alertType\": \"unused_index\""));
    assert!(raw.contains("\"alertType\": \"low_cache_hit\""));
    assert!(dir.path().join("logs").exists());

    let stats = log.daily_stats(now.date_naive()).await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_level.get("critical"), Some(&2));
}

#[tokio::test]
async fn test_failing_check_is_skipped_for_that_tick() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;

    let source = Arc::new(MemorySource::new());
    let t = build_monitor_with_source(config, AnalysisEngine::disabled(), source.clone());
    source.set_rows(
        CheckQuery::RunningOperations,
        vec![running_op(51, 15_000, "SELECT 1"), running_op(52, 4_000, "SELECT 2")],
    );
    source.push_failure(CheckQuery::HighCpuOperations, "permission denied");

    let report = t.monitor.run_tick().await;
    assert_eq!(report.failed_checks, vec!["high_cpu".to_string()]);
    assert_eq!(report.findings.len(), 2);
    assert_eq!(t.channel.delivered().len(), 2);
}

#[tokio::test]
async fn test_disabled_ai_leaves_findings_untouched() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;
    config.ai.enabled = false;

    let engine = AnalysisEngine::from_config(&config.ai);
    assert!(!engine.is_enabled());

    let t = build_monitor(config, engine);
    t.source.set_rows(
        CheckQuery::RunningOperations,
        vec![running_op(51, 60_000, "SELECT * FROM orders WHERE id = 7")],
    );
    t.monitor.run_tick().await;

    let delivered = t.channel.delivered();
    assert_eq!(delivered[0].level, Level::Critical);
    assert!(delivered[0].analysis.is_none());
    assert!(t.monitor.engine().cost_tracker().is_none());
    let stats = t.monitor.engine().stats();
    assert!(!stats.enabled);
    assert_eq!(stats.calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_reports_summary_on_cancel() {
    let (mut config, _dir) = test_config();
    config.logging.enabled = false;
    config.monitoring.interval_seconds = 5;

    let t = build_monitor(config, AnalysisEngine::disabled());
    t.source.set_rows(
        CheckQuery::RunningOperations,
        vec![running_op(51, 15_000, "SELECT * FROM orders")],
    );

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(22)).await;
        cancel.cancel();
    });

    let summary = t.monitor.run(token).await.unwrap();
    assert_eq!(summary.ticks, 5);
    assert_eq!(summary.level_counts.get(&Level::Critical), Some(&5));
    assert_eq!(summary.channels["mock"].sent, 1);
    assert_eq!(summary.channels["mock"].suppressed, 4);
    assert!(t.source.is_closed());

    let rendered = summary.to_string();
    assert!(rendered.contains("critical=5"));
    assert!(rendered.contains("channel mock: sent 1, failed 0, suppressed 4"));
}
