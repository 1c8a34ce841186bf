//! Alert dispatcher
//!
//! Every finding is optionally analyzed, written to the daily log, traced, and
//! then offered to each channel under the throttle. Channels are attempted
//! concurrently and never affect each other.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::log::AlertLog;
use super::throttle::{Throttle, ThrottleKey};
#[cfg(feature = "email")]
use super::email::EmailChannel;
use super::webhook::WebhookChannel;
use super::NotificationChannel;
use crate::ai::AnalysisEngine;
use crate::config::{MonitorConfig, ThrottleScope};
use crate::model::{Finding, Level};

/// How cooldowns are keyed
#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    pub scope: ThrottleScope,
    /// Window used in shared scope
    pub window: Duration,
}

impl ThrottlePolicy {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            scope: config.notifications.throttle_scope,
            window: Duration::minutes(config.notifications.throttle_minutes as i64),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub failed: u64,
    pub suppressed: u64,
}

#[derive(Default)]
struct ChannelCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
}

struct ChannelSlot {
    channel: Arc<dyn NotificationChannel>,
    counters: ChannelCounters,
}

/// What happened to one finding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub logged: bool,
    pub analyzed: bool,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    pub suppressed: Vec<String>,
}

pub struct Dispatcher {
    channels: Vec<ChannelSlot>,
    throttle: Throttle,
    policy: ThrottlePolicy,
    alert_log: Option<AlertLog>,
    engine: Arc<AnalysisEngine>,
    level_counts: [AtomicU64; 3],
}

fn level_index(level: Level) -> usize {
    match level {
        Level::Info => 0,
        Level::Warning => 1,
        Level::Critical => 2,
    }
}

impl Dispatcher {
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        engine: Arc<AnalysisEngine>,
        alert_log: Option<AlertLog>,
        policy: ThrottlePolicy,
    ) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|channel| ChannelSlot {
                    channel,
                    counters: ChannelCounters::default(),
                })
                .collect(),
            throttle: Throttle::new(),
            policy,
            alert_log,
            engine,
            level_counts: Default::default(),
        }
    }

    /// Build channels and the alert log from configuration.
    ///
    /// A channel that cannot be built is logged and left out.
    pub fn from_config(config: &MonitorConfig, engine: Arc<AnalysisEngine>) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

        if config.email.enabled {
            #[cfg(feature = "email")]
            {
                match EmailChannel::from_config(&config.email) {
                    Ok(channel) => channels.push(Arc::new(channel)),
                    Err(e) => error!(error = %e, "Email channel disabled"),
                }
            }
            #[cfg(not(feature = "email"))]
            {
                warn!("Email is enabled in configuration but this build has no email support");
            }
        }

        if config.webhook.enabled {
            match WebhookChannel::from_config(&config.webhook) {
                Ok(webhooks) => {
                    for webhook in webhooks {
                        channels.push(Arc::new(webhook));
                    }
                }
                Err(e) => error!(error = %e, "Webhook channels disabled"),
            }
        }

        let alert_log = config
            .logging
            .enabled
            .then(|| AlertLog::new(&config.logging, &config.database));

        info!(
            channels = channels.len(),
            alert_log = alert_log.is_some(),
            "Alert dispatcher ready"
        );
        Self::new(channels, engine, alert_log, ThrottlePolicy::from_config(config))
    }

    pub fn alert_log(&self) -> Option<&AlertLog> {
        self.alert_log.as_ref()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|slot| slot.channel.name().to_string())
            .collect()
    }

    pub async fn dispatch(&self, finding: Finding) -> DispatchOutcome {
        self.dispatch_at(finding, Utc::now()).await
    }

    /// Dispatch with an explicit clock for throttling
    pub async fn dispatch_at(&self, mut finding: Finding, now: DateTime<Utc>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if self.engine.should_analyze(&finding) {
            finding.analysis = self.engine.analyze(&finding).await;
            outcome.analyzed = finding.analysis.is_some();
        }

        if let Some(log) = &self.alert_log {
            match log.append(&finding).await {
                Ok(_) => outcome.logged = true,
                Err(e) => error!(error = %e, "Failed to write alert log"),
            }
        }

        trace_finding(&finding);
        self.level_counts[level_index(finding.level)].fetch_add(1, Ordering::Relaxed);

        let eligible: Vec<&ChannelSlot> = self
            .channels
            .iter()
            .filter(|slot| slot.channel.accepts(finding.level))
            .collect();
        if eligible.is_empty() {
            return outcome;
        }

        match self.policy.scope {
            ThrottleScope::Shared => self.deliver_shared(&finding, eligible, now, &mut outcome).await,
            ThrottleScope::PerChannel => {
                self.deliver_per_channel(&finding, eligible, now, &mut outcome)
                    .await
            }
        }
        outcome
    }

    async fn deliver_shared(
        &self,
        finding: &Finding,
        eligible: Vec<&ChannelSlot>,
        now: DateTime<Utc>,
        outcome: &mut DispatchOutcome,
    ) {
        let key = ThrottleKey::Shared {
            finding_type: finding.finding_type,
            level: finding.level,
        };
        let Some(claim) = self.throttle.try_claim(key, self.policy.window, now) else {
            for slot in &eligible {
                slot.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                outcome.suppressed.push(slot.channel.name().to_string());
            }
            debug!(finding_type = %finding.finding_type, level = %finding.level, "Notification throttled");
            return;
        };

        let results = join_all(eligible.iter().map(|slot| slot.channel.send(finding))).await;
        for (slot, result) in eligible.iter().zip(results) {
            self.record(slot, result, outcome);
        }

        if outcome.delivered.is_empty() {
            self.throttle.rollback(claim);
        }
    }

    async fn deliver_per_channel(
        &self,
        finding: &Finding,
        eligible: Vec<&ChannelSlot>,
        now: DateTime<Utc>,
        outcome: &mut DispatchOutcome,
    ) {
        let mut claimed = Vec::new();
        for slot in eligible {
            let key = ThrottleKey::Channel {
                channel: slot.channel.name().to_string(),
                finding_type: finding.finding_type,
                level: finding.level,
            };
            match self
                .throttle
                .try_claim(key, slot.channel.throttle_window(), now)
            {
                Some(claim) => claimed.push((slot, claim)),
                None => {
                    slot.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    outcome.suppressed.push(slot.channel.name().to_string());
                }
            }
        }

        let results = join_all(claimed.iter().map(|(slot, _)| slot.channel.send(finding))).await;
        for ((slot, claim), result) in claimed.into_iter().zip(results) {
            if result.is_err() {
                self.throttle.rollback(claim);
            }
            self.record(slot, result, outcome);
        }
    }

    fn record(
        &self,
        slot: &ChannelSlot,
        result: crate::error::NotifyResult<()>,
        outcome: &mut DispatchOutcome,
    ) {
        let name = slot.channel.name().to_string();
        match result {
            Ok(()) => {
                slot.counters.sent.fetch_add(1, Ordering::Relaxed);
                outcome.delivered.push(name);
            }
            Err(e) => {
                slot.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %name, error = %e, "Notification delivery failed");
                outcome.failed.push(name);
            }
        }
    }

    pub fn level_count(&self, level: Level) -> u64 {
        self.level_counts[level_index(level)].load(Ordering::Relaxed)
    }

    pub fn level_counts(&self) -> BTreeMap<Level, u64> {
        Level::ALL
            .iter()
            .map(|level| (*level, self.level_count(*level)))
            .collect()
    }

    pub fn channel_stats(&self) -> BTreeMap<String, ChannelStats> {
        self.channels
            .iter()
            .map(|slot| {
                (
                    slot.channel.name().to_string(),
                    ChannelStats {
                        sent: slot.counters.sent.load(Ordering::Relaxed),
                        failed: slot.counters.failed.load(Ordering::Relaxed),
                        suppressed: slot.counters.suppressed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

fn trace_finding(finding: &Finding) {
    let session_id = finding.session_id.unwrap_or_default();
    match finding.level {
        Level::Critical => error!(
            finding_type = %finding.finding_type,
            level = %finding.level,
            session_id,
            "{}",
            finding.message
        ),
        Level::Warning => warn!(
            finding_type = %finding.finding_type,
            level = %finding.level,
            session_id,
            "{}",
            finding.message
        ),
        Level::Info => info!(
            finding_type = %finding.finding_type,
            level = %finding.level,
            session_id,
            "{}",
            finding.message
        ),
    }
}
