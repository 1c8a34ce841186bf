//! Alert dispatch and notification channels

mod dispatcher;
#[cfg(feature = "email")]
mod email;
mod log;
mod throttle;
mod webhook;

use async_trait::async_trait;
use chrono::Duration;

use crate::error::NotifyResult;
use crate::model::{Finding, Level};

pub use dispatcher::{ChannelStats, DispatchOutcome, Dispatcher, ThrottlePolicy};
#[cfg(feature = "email")]
pub use email::{render_html, render_subject, EmailChannel};
pub use log::{AlertDetails, AlertLog, AlertLogEntry, AlertMetadata, DailyStats, MONITOR_VERSION};
pub use throttle::{Claim, Throttle, ThrottleKey};
pub use webhook::{build_payload, WebhookChannel};

/// A single-attempt delivery target
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Unique name used for counters and per-channel throttling
    fn name(&self) -> &str;

    /// Whether findings of `level` go to this channel
    fn accepts(&self, level: Level) -> bool;

    /// Cooldown used when throttling per channel
    fn throttle_window(&self) -> Duration;

    async fn send(&self, finding: &Finding) -> NotifyResult<()>;
}

pub(crate) fn level_emoji(level: Level) -> &'static str {
    match level {
        Level::Critical => "🚨",
        Level::Warning => "⚠️",
        Level::Info => "ℹ️",
    }
}

/// Label/value pairs shared by every rendered payload
pub(crate) fn finding_facts(finding: &Finding) -> Vec<(&'static str, String)> {
    let mut facts = vec![
        ("Type", finding.finding_type.title()),
        ("Level", finding.level.as_str().to_uppercase()),
        ("Time", finding.timestamp.to_rfc3339()),
    ];
    if let Some(name) = &finding.query_name {
        facts.push(("Watch", name.clone()));
    }
    if let Some(session) = finding.session_id {
        facts.push(("Session", session.to_string()));
    }
    if let Some(database) = &finding.database {
        facts.push(("Database", database.clone()));
    }
    let metrics = &finding.metrics;
    if let Some(ms) = metrics.execution_time_ms {
        facts.push(("Execution time", format!("{} ms", ms)));
    }
    if let Some(ms) = metrics.cpu_time_ms {
        facts.push(("CPU time", format!("{} ms", ms)));
    }
    if let Some(reads) = metrics.logical_reads {
        facts.push(("Logical reads", reads.to_string()));
    }
    if let Some(wait) = &metrics.wait_type {
        facts.push(("Wait type", wait.clone()));
    }
    if let Some(blocker) = metrics.blocking_session_id {
        facts.push(("Blocked by", blocker.to_string()));
    }
    facts
}
