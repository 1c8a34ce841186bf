//! Monitor scheduler
//!
//! The tick loop runs every enabled check against the data source in turn,
//! each bounded by its own timeout and all of them by the tick timeout, and
//! then dispatches what they found. Ticks never overlap. Lock history
//! persistence, analysis cache sweeping and cost-window resets run as
//! separate tasks that share the loop's cancellation token.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ai::{AnalysisEngine, EngineStats};
use crate::checks::{CheckContext, CheckSet, WatchStats};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::locks::{
    lock_tracker, LockHistorySnapshot, LockHistoryStore, LockTracker, SharedTracker, TrackerSettings,
    TrackerStats,
};
use crate::model::{Finding, FindingType, Level};
use crate::notify::{ChannelStats, DailyStats, Dispatcher};
use crate::source::{build_source, DataSource};

/// How often the cost window boundary is checked
const COST_RESET_POLL: Duration = Duration::from_secs(60);

/// What one tick did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub findings: Vec<(FindingType, Level)>,
    pub failed_checks: Vec<String>,
    pub timed_out_checks: Vec<String>,
    pub delivered: usize,
    pub suppressed: usize,
}

/// Printed at shutdown
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSummary {
    pub ticks: u64,
    pub check_failures: u64,
    pub level_counts: BTreeMap<Level, u64>,
    pub lock_history: TrackerStats,
    pub ai: EngineStats,
    pub watched_queries: Vec<WatchStats>,
    pub today: Option<DailyStats>,
    pub channels: BTreeMap<String, ChannelStats>,
}

impl fmt::Display for MonitorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DBSentinel summary")?;
        writeln!(f, "  ticks: {} (check failures: {})", self.ticks, self.check_failures)?;

        let levels: Vec<String> = self
            .level_counts
            .iter()
            .rev()
            .map(|(level, count)| format!("{}={}", level, count))
            .collect();
        writeln!(f, "  findings: {}", levels.join(" "))?;

        let history = &self.lock_history;
        writeln!(
            f,
            "  lock history: {}/{} entries ({:.1}%), avg {:.0}s, max {}s, evictions {}",
            history.total_entries,
            history.max_entries,
            history.usage_percent,
            history.avg_duration_seconds,
            history.max_duration_seconds,
            history.evictions
        )?;
        if let Some(oldest) = &history.oldest_entry {
            writeln!(f, "    longest tracked: {}", oldest)?;
        }

        if self.ai.enabled {
            writeln!(
                f,
                "  ai: {} calls, {} cache hits, {} misses ({:.1}% hit rate), ${:.4}",
                self.ai.calls,
                self.ai.cache_hits,
                self.ai.cache_misses,
                self.ai.hit_rate * 100.0,
                self.ai.total_cost
            )?;
        } else {
            writeln!(f, "  ai: disabled")?;
        }

        if !self.watched_queries.is_empty() {
            writeln!(f, "  watched queries:")?;
            for watch in &self.watched_queries {
                writeln!(
                    f,
                    "    {}: {} runs, avg {}ms, min {}ms, max {}ms",
                    watch.name, watch.count, watch.avg_ms, watch.min_ms, watch.max_ms
                )?;
            }
        }

        if let Some(today) = &self.today {
            writeln!(
                f,
                "  today's log: {} alerts, avg {:.0}ms, max {}ms",
                today.total, today.avg_execution_time_ms, today.max_execution_time_ms
            )?;
        }

        for (name, stats) in &self.channels {
            writeln!(
                f,
                "  channel {}: sent {}, failed {}, suppressed {}",
                name, stats.sent, stats.failed, stats.suppressed
            )?;
        }
        Ok(())
    }
}

pub struct Monitor {
    config: Arc<MonitorConfig>,
    source: Arc<dyn DataSource>,
    checks: CheckSet,
    tracker: SharedTracker,
    history: LockHistoryStore,
    engine: Arc<AnalysisEngine>,
    dispatcher: Arc<Dispatcher>,
    ticks: AtomicU64,
    check_failures: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        config: Arc<MonitorConfig>,
        source: Arc<dyn DataSource>,
        engine: Arc<AnalysisEngine>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let tracker: SharedTracker = Arc::new(Mutex::new(LockTracker::new(TrackerSettings::from(
            &config.lock_monitoring,
        ))));
        let checks = CheckSet::from_config(&config, tracker.clone());
        let history = LockHistoryStore::from_config(&config.lock_monitoring);

        Self {
            config,
            source,
            checks,
            tracker,
            history,
            engine,
            dispatcher,
            ticks: AtomicU64::new(0),
            check_failures: AtomicU64::new(0),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Wire every component from a validated configuration
    pub fn from_config(config: MonitorConfig) -> Self {
        let config = Arc::new(config);
        let source = build_source(&config.data_source);
        let engine = Arc::new(AnalysisEngine::from_config(&config.ai));
        let dispatcher = Arc::new(Dispatcher::from_config(&config, engine.clone()));
        Self::new(config, source, engine, dispatcher)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn engine(&self) -> &Arc<AnalysisEngine> {
        &self.engine
    }

    pub fn history(&self) -> &LockHistoryStore {
        &self.history
    }

    /// Connect, restore lock history and expire old alert logs.
    ///
    /// Only the connection can fail; returns the number of restored entries.
    pub async fn start(&self) -> Result<usize> {
        self.source.connect().await.map_err(MonitorError::from)?;
        info!(source = %self.source.describe(), checks = ?self.checks.names(), "Connected to data source");

        let restored = if self.config.lock_monitoring.enabled {
            let mut tracker = lock_tracker(&self.tracker);
            self.history.restore_into(&mut tracker, Utc::now())
        } else {
            0
        };

        if let Some(log) = self.dispatcher.alert_log() {
            match log.cleanup(Utc::now().date_naive()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Expired alert logs removed"),
                Err(e) => warn!(error = %e, "Alert log cleanup failed"),
            }
        }

        Ok(restored)
    }

    pub async fn run_tick(&self) -> TickReport {
        self.run_tick_at(Utc::now()).await
    }

    /// One tick with an explicit timestamp for findings, tracking and throttling
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> TickReport {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport::default();
        let findings = self.collect_findings(now, &mut report).await;

        for finding in findings {
            report.findings.push((finding.finding_type, finding.level));
            let outcome = self.dispatcher.dispatch_at(finding, now).await;
            report.delivered += outcome.delivered.len();
            report.suppressed += outcome.suppressed.len();
        }

        debug!(
            findings = report.findings.len(),
            failed = report.failed_checks.len() + report.timed_out_checks.len(),
            "Tick complete"
        );
        report
    }

    async fn collect_findings(&self, now: DateTime<Utc>, report: &mut TickReport) -> Vec<Finding> {
        let ctx = CheckContext::new(self.config.clone(), now);
        let check_timeout = Duration::from_secs(self.config.monitoring.check_timeout_seconds);
        let deadline = Instant::now() + Duration::from_secs(self.config.tick_timeout_seconds());
        let mut findings = Vec::new();

        for check in &self.checks.checks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(check = check.name(), "Tick timeout reached, skipping check");
                report.timed_out_checks.push(check.name().to_string());
                self.check_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let limit = check_timeout.min(remaining);
            match tokio::time::timeout(limit, check.run(self.source.as_ref(), &ctx)).await {
                Ok(Ok(found)) => findings.extend(found),
                Ok(Err(e)) => {
                    let e = MonitorError::from(e);
                    warn!(check = check.name(), category = e.category(), error = %e, "Check failed");
                    report.failed_checks.push(check.name().to_string());
                    self.check_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    warn!(check = check.name(), timeout_ms = limit.as_millis() as u64, "Check timed out");
                    report.timed_out_checks.push(check.name().to_string());
                    self.check_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        findings
    }

    /// Run until `token` is cancelled, then shut down and summarize.
    ///
    /// A tick already in progress when the token fires is completed.
    pub async fn run(&self, token: CancellationToken) -> Result<MonitorSummary> {
        let restored = self.start().await?;
        let background = token.child_token();
        self.spawn_background(&background);

        info!(
            interval_seconds = self.config.monitoring.interval_seconds,
            restored_conflicts = restored,
            channels = ?self.dispatcher.channel_names(),
            ai = self.engine.is_enabled(),
            "Monitor started"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.monitoring.interval_seconds));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.run_tick().await;
                }
            }
        }

        info!("Shutdown requested, stopping monitor");
        background.cancel();
        Ok(self.shutdown().await)
    }

    /// Stop background tasks, flush history, close the source
    pub async fn shutdown(&self) -> MonitorSummary {
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if self.config.lock_monitoring.enabled {
            let tracker = lock_tracker(&self.tracker);
            match self.history.save(&tracker, Utc::now()) {
                Ok(()) => info!(entries = tracker.len(), path = %self.history.path().display(), "Lock history flushed"),
                Err(e) => error!(error = %e, "Failed to flush lock history"),
            }
        }

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close data source");
        }

        self.summary().await
    }

    pub async fn summary(&self) -> MonitorSummary {
        let today = match self.dispatcher.alert_log() {
            Some(log) => match log.daily_stats(Utc::now().date_naive()).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    debug!(error = %e, "No alert log statistics for today");
                    None
                }
            },
            None => None,
        };

        MonitorSummary {
            ticks: self.ticks.load(Ordering::Relaxed),
            check_failures: self.check_failures.load(Ordering::Relaxed),
            level_counts: self.dispatcher.level_counts(),
            lock_history: lock_tracker(&self.tracker).stats(Utc::now()),
            ai: self.engine.stats(),
            watched_queries: self
                .checks
                .watcher
                .as_ref()
                .map(|watcher| watcher.stats())
                .unwrap_or_default(),
            today,
            channels: self.dispatcher.channel_stats(),
        }
    }

    fn spawn_background(&self, token: &CancellationToken) {
        let mut handles = Vec::new();

        if self.config.lock_monitoring.enabled {
            let period = Duration::from_secs(self.config.lock_monitoring.persist_interval_seconds.max(1));
            handles.push(tokio::spawn(persist_history(
                self.tracker.clone(),
                self.history.clone(),
                period,
                token.clone(),
            )));
        }

        if let Some(cache) = self.engine.cache().cloned() {
            let period = Duration::from_secs(self.config.ai.cache.sweep_seconds.max(1));
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                every(period, token, || {
                    let cache = cache.clone();
                    async move {
                        let removed = cache.sweep().await;
                        if removed > 0 {
                            debug!(removed, backend = cache.backend(), "Analysis cache swept");
                        }
                    }
                })
                .await
            }));
        }

        if let Some(cost) = self.engine.cost_tracker().cloned() {
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                every(COST_RESET_POLL, token, || {
                    let cost = cost.clone();
                    async move {
                        cost.check_reset();
                    }
                })
                .await
            }));
        }

        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }
}

/// Run `job` every `period` until cancelled, skipping the immediate first tick
async fn every<F, Fut>(period: Duration, token: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => job().await,
        }
    }
}

async fn persist_history(
    tracker: SharedTracker,
    store: LockHistoryStore,
    period: Duration,
    token: CancellationToken,
) {
    every(period, token, || {
        let snapshot = LockHistorySnapshot::capture(&lock_tracker(&tracker), Utc::now());
        let store = store.clone();
        async move {
            let entries = snapshot.entries.len();
            match tokio::task::spawn_blocking(move || store.write(&snapshot)).await {
                Ok(Ok(())) => debug!(entries, "Lock history persisted"),
                Ok(Err(e)) => warn!(error = %e, "Lock history persistence failed"),
                Err(e) => warn!(error = %e, "Lock history persistence task failed"),
            }
        }
    })
    .await
}
