//! Configuration management for the DBSentinel monitor
//!
//! Configuration is read once at startup from an optional TOML or JSON file,
//! layered under `DBSENTINEL__SECTION__KEY` environment variables, validated,
//! and then shared read-only as `Arc<MonitorConfig>`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{Level, Metric, ThresholdSet};

/// Environment prefix for overrides, e.g. `DBSENTINEL__MONITORING__INTERVAL_SECONDS`
pub const ENV_PREFIX: &str = "DBSENTINEL";

/// Fallback variable for the SMTP password
pub const SMTP_PASSWORD_ENV: &str = "DBSENTINEL_SMTP_PASSWORD";

/// Main configuration structure for the monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Identity of the monitored database, copied into findings
    pub database: DatabaseConfig,

    /// How introspection rows are obtained
    pub data_source: DataSourceConfig,

    /// Tick scheduling and check selection
    pub monitoring: MonitoringConfig,

    /// Severity floors per metric
    pub thresholds: ThresholdsConfig,

    /// Lock accumulation tracking
    pub lock_monitoring: LockMonitoringConfig,

    /// Named regex watches
    pub watch_queries: Vec<WatchQueryConfig>,

    /// Normalized query text to watch name
    pub watch_signatures: HashMap<String, String>,

    /// Buffer cache floor
    pub cache_hit: CacheHitConfig,

    /// AI-assisted analysis
    pub ai: AiConfig,

    /// Email channel
    pub email: EmailConfig,

    /// Webhook channels
    pub webhook: WebhookConfig,

    /// Cross-channel notification policy
    pub notifications: NotificationsConfig,

    /// Daily alert log
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: Option<String>,
    pub server: Option<String>,
}

/// Kind of data source adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub kind: SourceKind,

    /// Program invoked once per check query
    pub program: String,

    /// Arguments placed before the query id
    pub args: Vec<String>,

    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Seconds between ticks
    pub interval_seconds: u64,

    pub enabled_checks: EnabledChecks,

    /// Per-check timeout
    pub check_timeout_seconds: u64,

    /// Whole-tick timeout; defaults to three intervals
    pub tick_timeout_seconds: Option<u64>,

    /// Rows considered by the slow-operation and CPU checks
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnabledChecks {
    pub slow_queries: bool,
    pub blocking: bool,
    pub high_cpu: bool,
    pub watch_queries: bool,
    pub unused_indexes: bool,
    pub cache_hit: bool,
}

/// Floors for every metric at one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricFloors {
    pub execution_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub blocking_time_ms: Option<u64>,
}

impl MetricFloors {
    fn get(&self, metric: Metric) -> Option<u64> {
        match metric {
            Metric::ExecutionTime => self.execution_time_ms,
            Metric::CpuTime => self.cpu_time_ms,
            Metric::BlockingTime => self.blocking_time_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub info: MetricFloors,
    pub warning: MetricFloors,
    pub critical: MetricFloors,
}

impl ThresholdsConfig {
    /// Ordered floors for one metric
    pub fn for_metric(&self, metric: Metric) -> ThresholdSet {
        ThresholdSet::new(
            self.info.get(metric),
            self.warning.get(metric),
            self.critical.get(metric),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockMonitoringConfig {
    pub enabled: bool,

    /// Continuous duration before a lock_accumulation alert
    pub accumulation_minutes: u64,

    /// Upper bound on tracked conflicts
    pub max_entries: usize,

    /// How long an unseen conflict is kept
    pub grace_seconds: u64,

    pub persist_path: PathBuf,

    pub persist_interval_seconds: u64,

    /// Entries older than this are dropped when the snapshot is loaded
    pub max_age_on_load_minutes: u64,

    /// Re-alert every accumulation period while the conflict persists
    pub repeat_alerts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchQueryConfig {
    pub name: String,

    /// Case-insensitive regex matched against the running statement
    pub pattern: String,

    #[serde(default = "default_watch_threshold")]
    pub threshold_ms: u64,
}

fn default_watch_threshold() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheHitConfig {
    pub min_ratio_percent: f64,
}

/// Analysis provider vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
        }
    }

    /// Conventional environment variable holding the vendor key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Openai => "OPENAI_API_KEY",
        }
    }
}

/// Analysis cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub cache: AiCacheConfig,
    pub budget: BudgetConfig,
    pub triggers: TriggerConfig,
    pub features: FeatureConfig,

    /// USD per 1K tokens, overriding the built-in table
    pub pricing_per_1k_tokens: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiCacheConfig {
    #[serde(rename = "type")]
    pub kind: CacheKind,
    pub ttl_seconds: u64,
    pub sweep_seconds: u64,
    pub redis_url: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_cost_per_hour: f64,

    /// Fraction of the budget at which spending is reported
    pub alert_on_threshold: f64,

    pub window_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub on_level: Vec<Level>,
    pub min_execution_time: u64,
    pub max_ai_calls_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub root_cause_analysis: bool,
    pub optimization_suggestion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub starttls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp: SmtpConfig,
    pub from: String,
    pub to: Vec<String>,
    pub send_on_levels: Vec<Level>,
    pub throttle_minutes: u64,
}

/// Webhook wire shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookKind {
    Generic,
    Slack,
    Discord,
    #[serde(alias = "msteams")]
    Teams,
    #[serde(alias = "googlechat")]
    GoogleChat,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Generic => "generic",
            WebhookKind::Slack => "slack",
            WebhookKind::Discord => "discord",
            WebhookKind::Teams => "teams",
            WebhookKind::GoogleChat => "google-chat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTargetConfig {
    #[serde(rename = "type", default = "default_webhook_kind")]
    pub kind: WebhookKind,
    pub url: String,
    pub name: Option<String>,
}

fn default_webhook_kind() -> WebhookKind {
    WebhookKind::Generic
}

impl WebhookTargetConfig {
    /// Channel name used in logs and counters when the target stands alone
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("webhook-{}", self.kind.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub webhooks: Vec<WebhookTargetConfig>,
    pub send_on_levels: Vec<Level>,
    pub throttle_minutes: u64,
    pub timeout_seconds: u64,
}

impl WebhookConfig {
    /// One channel name per target, in order.
    ///
    /// Unnamed targets sharing a kind are numbered by position
    /// (`webhook-slack-1`, `webhook-slack-2`) so each keeps its own throttle
    /// key and counters.
    pub fn channel_names(&self) -> Vec<String> {
        let defaults: Vec<String> = self.webhooks.iter().map(|t| t.display_name()).collect();
        self.webhooks
            .iter()
            .enumerate()
            .map(|(i, target)| {
                if target.name.is_some() {
                    return defaults[i].clone();
                }
                let shared = self
                    .webhooks
                    .iter()
                    .zip(&defaults)
                    .filter(|(other, name)| other.name.is_none() && **name == defaults[i])
                    .count();
                if shared > 1 {
                    format!("{}-{}", defaults[i], i + 1)
                } else {
                    defaults[i].clone()
                }
            })
            .collect()
    }
}

/// Scope of the notification cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleScope {
    /// One (type, level) key shared by every channel
    Shared,
    /// One (channel, type, level) key per channel
    PerChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub throttle_scope: ThrottleScope,
    pub throttle_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write the daily alert log
    pub enabled: bool,
    pub directory: PathBuf,
    pub retention_days: u32,
    pub max_query_text_length: usize,

    /// Default tracing filter when neither flag nor RUST_LOG is set
    pub level: String,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Command,
            program: "dbsentinel-probe".to_string(),
            args: Vec::new(),
            timeout_seconds: 30,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            enabled_checks: EnabledChecks::default(),
            check_timeout_seconds: 30,
            tick_timeout_seconds: None,
            top_n: 5,
        }
    }
}

impl Default for EnabledChecks {
    fn default() -> Self {
        Self {
            slow_queries: true,
            blocking: true,
            high_cpu: true,
            watch_queries: false,
            unused_indexes: false,
            cache_hit: false,
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            info: MetricFloors {
                execution_time_ms: Some(1000),
                cpu_time_ms: Some(500),
                blocking_time_ms: Some(1000),
            },
            warning: MetricFloors {
                execution_time_ms: Some(3000),
                cpu_time_ms: Some(2000),
                blocking_time_ms: Some(5000),
            },
            critical: MetricFloors {
                execution_time_ms: Some(10000),
                cpu_time_ms: Some(5000),
                blocking_time_ms: Some(30000),
            },
        }
    }
}

impl Default for LockMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            accumulation_minutes: 10,
            max_entries: 10_000,
            grace_seconds: 5,
            persist_path: default_history_path(),
            persist_interval_seconds: 60,
            max_age_on_load_minutes: 60,
            repeat_alerts: true,
        }
    }
}

impl Default for CacheHitConfig {
    fn default() -> Self {
        Self {
            min_ratio_percent: 90.0,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: ProviderKind::Anthropic,
            model: "claude-3-haiku-20240307".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 1000,
            temperature: 0.2,
            timeout_seconds: 30,
            cache: AiCacheConfig::default(),
            budget: BudgetConfig::default(),
            triggers: TriggerConfig::default(),
            features: FeatureConfig::default(),
            pricing_per_1k_tokens: HashMap::new(),
        }
    }
}

impl Default for AiCacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            ttl_seconds: 86_400,
            sweep_seconds: 60,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            prefix: "dbsentinel:".to_string(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_per_hour: 0.1,
            alert_on_threshold: 0.8,
            window_minutes: 60,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            on_level: vec![Level::Critical],
            min_execution_time: 5000,
            max_ai_calls_per_hour: 10,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            root_cause_analysis: true,
            optimization_suggestion: true,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            starttls: true,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp: SmtpConfig::default(),
            from: "dbsentinel@localhost".to_string(),
            to: Vec::new(),
            send_on_levels: vec![Level::Critical, Level::Warning],
            throttle_minutes: 10,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhooks: Vec::new(),
            send_on_levels: vec![Level::Critical, Level::Warning],
            throttle_minutes: 10,
            timeout_seconds: 10,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            throttle_scope: ThrottleScope::Shared,
            throttle_minutes: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./logs"),
            retention_days: 30,
            max_query_text_length: 500,
            level: "info".to_string(),
        }
    }
}

fn default_history_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("dbsentinel"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lock-history.json")
}

impl MonitorConfig {
    /// Load configuration from a TOML or JSON file, without environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let config: MonitorConfig = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::ParseError {
                reason: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration: file (if any) -> environment -> secret fallbacks
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_string_lossy().to_string(),
                });
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: MonitorConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::ParseError {
                reason: e.to_string(),
            })?;

        config.resolve_secrets();
        config.validate()?;
        Ok(config)
    }

    /// Fill unset secrets from their conventional environment variables
    pub fn resolve_secrets(&mut self) {
        if self.ai.api_key.as_deref().map_or(true, str::is_empty) {
            self.ai.api_key = std::env::var(self.ai.provider.api_key_env())
                .ok()
                .filter(|key| !key.is_empty());
        }

        if self.email.smtp.password.is_none() {
            self.email.smtp.password = std::env::var(SMTP_PASSWORD_ENV).ok();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.monitoring.interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitoring.interval_seconds".to_string(),
                value: "0".to_string(),
            });
        }

        if self.monitoring.check_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitoring.check_timeout_seconds".to_string(),
                value: "0".to_string(),
            });
        }

        for metric in [Metric::ExecutionTime, Metric::CpuTime, Metric::BlockingTime] {
            let set = self.thresholds.for_metric(metric);
            if !set.is_ordered() {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "thresholds for {} must satisfy info <= warning <= critical",
                        metric.field_name()
                    ),
                });
            }
        }

        if self.lock_monitoring.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_monitoring.max_entries".to_string(),
                value: "0".to_string(),
            });
        }

        if self.lock_monitoring.enabled && self.lock_monitoring.accumulation_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_monitoring.accumulation_minutes".to_string(),
                value: "0".to_string(),
            });
        }

        let fraction = self.ai.budget.alert_on_threshold;
        if fraction <= 0.0 || fraction > 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "ai.budget.alert_on_threshold".to_string(),
                value: fraction.to_string(),
            });
        }

        if self.ai.budget.window_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ai.budget.window_minutes".to_string(),
                value: "0".to_string(),
            });
        }

        if self.email.enabled && self.email.to.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "email is enabled but has no recipients".to_string(),
            });
        }

        if self.webhook.enabled && self.webhook.webhooks.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "webhook is enabled but has no targets".to_string(),
            });
        }

        if self.webhook.enabled {
            let mut seen = std::collections::HashSet::new();
            for name in self.webhook.channel_names() {
                if !seen.insert(name.clone()) {
                    return Err(ConfigError::InvalidValue {
                        field: "webhook.webhooks.name".to_string(),
                        value: format!("{} (duplicate)", name),
                    });
                }
            }
        }

        for watch in &self.watch_queries {
            if let Err(e) = regex::RegexBuilder::new(&watch.pattern)
                .case_insensitive(true)
                .build()
            {
                return Err(ConfigError::InvalidValue {
                    field: format!("watch_queries.{}.pattern", watch.name),
                    value: e.to_string(),
                });
            }
        }

        if self.data_source.program.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "data_source.program".to_string(),
                value: String::new(),
            });
        }

        Ok(())
    }

    /// Whole-tick timeout in seconds
    pub fn tick_timeout_seconds(&self) -> u64 {
        self.monitoring
            .tick_timeout_seconds
            .unwrap_or(self.monitoring.interval_seconds * 3)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("dbsentinel").join("monitor.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationFailed {
            reason: e.to_string(),
        })?;

        fs::write(path, content).map_err(|_| ConfigError::PermissionDenied {
            path: path.to_string_lossy().to_string(),
        })?;

        Ok(())
    }
}
