//! Webhook channel with vendor-specific payload shapes

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Value};
use tracing::debug;

use super::{finding_facts, level_emoji, NotificationChannel};
use crate::config::{WebhookConfig, WebhookKind, WebhookTargetConfig};
use crate::error::{NotifyError, NotifyResult};
use crate::model::{truncate_chars, Finding, Level};

const GENERIC_QUERY_CHARS: usize = 1000;
const CARD_QUERY_CHARS: usize = 500;

/// One webhook target
pub struct WebhookChannel {
    name: String,
    kind: WebhookKind,
    url: String,
    client: reqwest::Client,
    levels: Vec<Level>,
    throttle: Duration,
}

impl WebhookChannel {
    pub fn new(
        target: &WebhookTargetConfig,
        levels: Vec<Level>,
        throttle: Duration,
        timeout: StdDuration,
    ) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Misconfigured {
                channel: target.display_name(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: target.display_name(),
            kind: target.kind,
            url: target.url.clone(),
            client,
            levels,
            throttle,
        })
    }

    /// One channel per configured target, each under a distinct name
    pub fn from_config(config: &WebhookConfig) -> NotifyResult<Vec<Self>> {
        config
            .webhooks
            .iter()
            .zip(config.channel_names())
            .map(|(target, name)| {
                let mut channel = Self::new(
                    target,
                    config.send_on_levels.clone(),
                    Duration::minutes(config.throttle_minutes as i64),
                    StdDuration::from_secs(config.timeout_seconds),
                )?;
                channel.name = name;
                Ok(channel)
            })
            .collect()
    }

    pub fn kind(&self) -> WebhookKind {
        self.kind
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, level: Level) -> bool {
        self.levels.contains(&level)
    }

    fn throttle_window(&self) -> Duration {
        self.throttle
    }

    async fn send(&self, finding: &Finding) -> NotifyResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&build_payload(self.kind, finding))
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                channel: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                channel: self.name.clone(),
                status: status.as_u16(),
            });
        }

        debug!(channel = %self.name, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}

/// Render the request body for `kind`
pub fn build_payload(kind: WebhookKind, finding: &Finding) -> Value {
    match kind {
        WebhookKind::Generic => generic_payload(finding),
        WebhookKind::Slack => slack_payload(finding),
        WebhookKind::Discord => discord_payload(finding),
        WebhookKind::Teams => teams_payload(finding),
        WebhookKind::GoogleChat => google_chat_payload(finding),
    }
}

fn title(finding: &Finding) -> String {
    format!(
        "{} [{}] DB Alert - {}",
        level_emoji(finding.level),
        finding.level.as_str().to_uppercase(),
        finding.finding_type.title()
    )
}

fn card_query(finding: &Finding) -> Option<String> {
    finding
        .query_text
        .as_deref()
        .map(|q| truncate_chars(q, CARD_QUERY_CHARS, "..."))
}

fn generic_payload(finding: &Finding) -> Value {
    json!({
        "source": "dbsentinel",
        "timestamp": finding.timestamp.to_rfc3339(),
        "level": finding.level,
        "type": finding.finding_type,
        "message": finding.message,
        "sessionId": finding.session_id,
        "database": finding.database,
        "queryName": finding.query_name,
        "metrics": finding.metrics,
        "queryText": finding
            .query_text
            .as_deref()
            .map(|q| truncate_chars(q, GENERIC_QUERY_CHARS, "...")),
        "lockDetails": finding.lock_details,
        "indexDetails": finding.index_details,
        "cacheDetails": finding.cache_details,
        "analysis": finding.analysis,
    })
}

fn slack_payload(finding: &Finding) -> Value {
    let mut fields: Vec<Value> = finding_facts(finding)
        .into_iter()
        .map(|(label, value)| json!({"title": label, "value": value, "short": true}))
        .collect();
    if let Some(query) = card_query(finding) {
        fields.push(json!({"title": "Query", "value": format!("```{}```", query), "short": false}));
    }

    json!({
        "text": format!("*{}*", title(finding)),
        "attachments": [{
            "color": finding.level.color(),
            "text": finding.message,
            "fields": fields,
            "footer": "DBSentinel",
            "ts": finding.timestamp.timestamp(),
        }]
    })
}

fn discord_payload(finding: &Finding) -> Value {
    let mut fields: Vec<Value> = finding_facts(finding)
        .into_iter()
        .map(|(label, value)| json!({"name": label, "value": value, "inline": true}))
        .collect();
    if let Some(query) = card_query(finding) {
        fields.push(json!({"name": "Query", "value": format!("```sql\n{}\n```", query), "inline": false}));
    }

    let color = u32::from_str_radix(finding.level.color().trim_start_matches('#'), 16).unwrap_or(0);
    json!({
        "embeds": [{
            "title": title(finding),
            "description": finding.message,
            "color": color,
            "fields": fields,
            "timestamp": finding.timestamp.to_rfc3339(),
        }]
    })
}

fn teams_payload(finding: &Finding) -> Value {
    let mut facts: Vec<Value> = finding_facts(finding)
        .into_iter()
        .map(|(label, value)| json!({"name": label, "value": value}))
        .collect();
    if let Some(query) = card_query(finding) {
        facts.push(json!({"name": "Query", "value": query}));
    }

    json!({
        "@type": "MessageCard",
        "@context": "https://schema.org/extensions",
        "themeColor": finding.level.color().trim_start_matches('#'),
        "summary": title(finding),
        "sections": [{
            "activityTitle": title(finding),
            "activitySubtitle": finding.message,
            "facts": facts,
            "markdown": true,
        }]
    })
}

fn google_chat_payload(finding: &Finding) -> Value {
    let mut widgets: Vec<Value> = finding_facts(finding)
        .into_iter()
        .map(|(label, value)| json!({"keyValue": {"topLabel": label, "content": value}}))
        .collect();
    if let Some(query) = card_query(finding) {
        widgets.push(json!({"textParagraph": {"text": format!("<b>Query</b><br><font color=\"#6c757d\">{}</font>", query)}}));
    }

    json!({
        "cards": [{
            "header": {
                "title": title(finding),
                "subtitle": finding.message,
            },
            "sections": [{"widgets": widgets}],
        }]
    })
}
