//! SMTP email channel

use async_trait::async_trait;
use chrono::Duration;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::{finding_facts, level_emoji, NotificationChannel};
use crate::config::EmailConfig;
use crate::error::{NotifyError, NotifyResult};
use crate::model::{truncate_chars, Finding, Level};

const CHANNEL: &str = "email";
const EMAIL_QUERY_CHARS: usize = 2000;

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    levels: Vec<Level>,
    throttle: Duration,
}

fn misconfigured(reason: impl ToString) -> NotifyError {
    NotifyError::Misconfigured {
        channel: CHANNEL.to_string(),
        reason: reason.to_string(),
    }
}

impl EmailChannel {
    pub fn from_config(config: &EmailConfig) -> NotifyResult<Self> {
        let from: Mailbox = config.from.parse().map_err(misconfigured)?;
        let to = config
            .to
            .iter()
            .map(|addr| addr.parse::<Mailbox>().map_err(misconfigured))
            .collect::<NotifyResult<Vec<_>>>()?;
        if to.is_empty() {
            return Err(misconfigured("no recipients"));
        }

        let smtp = &config.smtp;
        let mut builder = if smtp.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host).map_err(misconfigured)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        }
        .port(smtp.port);

        if let (Some(user), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            levels: config.send_on_levels.clone(),
            throttle: Duration::minutes(config.throttle_minutes as i64),
        })
    }

    fn build_message(&self, finding: &Finding) -> NotifyResult<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(render_subject(finding))
            .header(ContentType::TEXT_HTML);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder
            .body(render_html(finding))
            .map_err(|e| NotifyError::SendFailed {
                channel: CHANNEL.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        CHANNEL
    }

    fn accepts(&self, level: Level) -> bool {
        self.levels.contains(&level)
    }

    fn throttle_window(&self) -> Duration {
        self.throttle
    }

    async fn send(&self, finding: &Finding) -> NotifyResult<()> {
        let message = self.build_message(finding)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyError::SendFailed {
                channel: CHANNEL.to_string(),
                reason: e.to_string(),
            })?;
        debug!(recipients = self.to.len(), "Alert email sent");
        Ok(())
    }
}

pub fn render_subject(finding: &Finding) -> String {
    format!(
        "{} [{}] DB Alert - {}",
        level_emoji(finding.level),
        finding.level.as_str().to_uppercase(),
        finding.finding_type.title()
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn render_html(finding: &Finding) -> String {
    let color = finding.level.color();
    let rows: String = finding_facts(finding)
        .into_iter()
        .map(|(label, value)| {
            format!(
                "<tr><td style=\"padding:4px 12px;color:#6c757d\">{}</td><td style=\"padding:4px 12px\">{}</td></tr>",
                label,
                escape_html(&value)
            )
        })
        .collect();

    let query = finding
        .query_text
        .as_deref()
        .map(|q| {
            format!(
                "<h3>Query</h3><pre style=\"background:#f8f9fa;border:1px solid #dee2e6;padding:12px;white-space:pre-wrap\">{}</pre>",
                escape_html(&truncate_chars(q, EMAIL_QUERY_CHARS, "..."))
            )
        })
        .unwrap_or_default();

    let analysis = finding
        .analysis
        .as_ref()
        .map(|a| {
            let mut html = String::from("<h3>AI Analysis</h3>");
            if let Some(cause) = &a.root_cause {
                html.push_str(&format!("<p><b>Root cause</b></p><pre>{}</pre>", escape_html(&cause.to_string())));
            }
            if let Some(optimization) = &a.optimization {
                html.push_str(&format!(
                    "<p><b>Optimization</b></p><pre>{}</pre>",
                    escape_html(&optimization.to_string())
                ));
            }
            html
        })
        .unwrap_or_default();

    format!(
        "<html><body style=\"font-family:Arial,sans-serif\">\
         <div style=\"background:{color};color:#fff;padding:12px 16px\"><h2 style=\"margin:0\">{title}</h2></div>\
         <p>{message}</p>\
         <table style=\"border-collapse:collapse\">{rows}</table>\
         {query}{analysis}\
         <p style=\"color:#6c757d;font-size:12px\">Sent by DBSentinel</p>\
         </body></html>",
        color = color,
        title = escape_html(&render_subject(finding)),
        message = escape_html(&finding.message),
        rows = rows,
        query = query,
        analysis = analysis,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmtpConfig;
    use crate::model::{FindingMetrics, FindingType};

    fn finding() -> Finding {
        Finding::new(FindingType::SlowOperation, Level::Warning, "query ran 4.2s")
            .with_metrics(FindingMetrics {
                execution_time_ms: Some(4200),
                ..FindingMetrics::default()
            })
            .with_query_text(Some("SELECT * FROM t WHERE a < 5 AND b = '<x>'"))
    }

    #[test]
    fn test_subject() {
        assert_eq!(render_subject(&finding()), "⚠️ [WARNING] DB Alert - SLOW OPERATION");
    }

    #[test]
    fn test_html_escapes_query() {
        let html = render_html(&finding());
        assert!(html.contains("#ffc107"));
        assert!(html.contains("a &lt; 5"));
        assert!(html.contains("&#39;&lt;x&gt;&#39;"));
        assert!(html.contains("4200 ms"));
    }

    #[test]
    fn test_config_errors() {
        let mut config = EmailConfig {
            enabled: true,
            to: vec!["not an address".to_string()],
            ..EmailConfig::default()
        };
        assert!(EmailChannel::from_config(&config).is_err());

        config.to = vec!["dba@example.com".to_string()];
        config.smtp = SmtpConfig {
            starttls: false,
            ..SmtpConfig::default()
        };
        let channel = EmailChannel::from_config(&config).unwrap();
        assert_eq!(channel.name(), "email");
        assert!(channel.accepts(Level::Warning));
        assert!(!channel.accepts(Level::Info));
        assert!(channel.build_message(&finding()).is_ok());
    }
}
