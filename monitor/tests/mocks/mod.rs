//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use tempfile::TempDir;

use dbsentinel_monitor::ai::{AnalysisProvider, Completion};
use dbsentinel_monitor::config::MonitorConfig;
use dbsentinel_monitor::error::{AnalysisError, AnalysisResult, NotifyError, NotifyResult};
use dbsentinel_monitor::notify::ThrottlePolicy;
use dbsentinel_monitor::{AnalysisEngine, Dispatcher, Finding, Level, MemorySource, Monitor, NotificationChannel, Row};

/// Notification channel that keeps everything it was asked to deliver
pub struct MockChannel {
    name: String,
    fail: bool,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<Finding>>,
}

impl MockChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn delivered(&self) -> Vec<Finding> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, _level: Level) -> bool {
        true
    }

    fn throttle_window(&self) -> Duration {
        Duration::minutes(10)
    }

    async fn send(&self, finding: &Finding) -> NotifyResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotifyError::SendFailed {
                channel: self.name.clone(),
                reason: "mock failure".to_string(),
            });
        }
        self.delivered.lock().unwrap().push(finding.clone());
        Ok(())
    }
}

/// Provider answering every prompt with the same JSON document
pub struct MockProvider {
    tokens: u64,
    fail: bool,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(tokens: u64) -> Self {
        Self {
            tokens,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "claude-3-haiku-20240307"
    }

    async fn complete(&self, _prompt: &str) -> AnalysisResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            return Err(AnalysisError::RequestFailed {
                provider: "mock".to_string(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(Completion {
            content: json!({"cause": "missing index on orders.customer_id"}).to_string(),
            tokens: self.tokens,
            model: "claude-3-haiku-20240307".to_string(),
        })
    }
}

/// Configuration writing every file into a temporary directory
pub fn test_config() -> (MonitorConfig, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = MonitorConfig::default();
    config.lock_monitoring.persist_path = dir.path().join("lock-history.json");
    config.logging.directory = dir.path().join("logs");
    (config, dir)
}

/// Monitor over a scripted source, delivering to one mock channel
pub struct TestMonitor {
    pub monitor: Monitor,
    pub source: Arc<MemorySource>,
    pub channel: Arc<MockChannel>,
}

pub fn build_monitor(config: MonitorConfig, engine: AnalysisEngine) -> TestMonitor {
    build_monitor_with_source(config, engine, Arc::new(MemorySource::new()))
}

pub fn build_monitor_with_source(
    config: MonitorConfig,
    engine: AnalysisEngine,
    source: Arc<MemorySource>,
) -> TestMonitor {
    let config = Arc::new(config);
    let channel = Arc::new(MockChannel::new("mock"));
    let engine = Arc::new(engine);
    let alert_log = config
        .logging
        .enabled
        .then(|| dbsentinel_monitor::notify::AlertLog::new(&config.logging, &config.database));
    let dispatcher = Arc::new(Dispatcher::new(
        vec![channel.clone()],
        engine.clone(),
        alert_log,
        ThrottlePolicy::from_config(&config),
    ));
    let monitor = Monitor::new(config, source.clone(), engine, dispatcher);
    TestMonitor {
        monitor,
        source,
        channel,
    }
}

pub fn running_op(session: i64, elapsed_ms: u64, text: &str) -> Row {
    Row::from_json(json!({
        "sessionId": session,
        "elapsedMs": elapsed_ms,
        "cpuMs": elapsed_ms / 4,
        "text": text,
    }))
}

pub fn blocking_pair(blocked: i64, blocker: i64, wait_ms: u64) -> Row {
    Row::from_json(json!({
        "blockedSessionId": blocked,
        "blockerSessionId": blocker,
        "waitTimeMs": wait_ms,
        "waitType": "LCK_M_X",
        "blockedText": "UPDATE stock SET qty = qty - 1 WHERE sku = 'A-1'",
        "blockerText": "SELECT * FROM stock WITH (UPDLOCK) WHERE sku = 'A-1'",
    }))
}
