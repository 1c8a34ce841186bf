//! Analysis orchestration: cache, then budget, then provider, then cache store

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::cache::{build_cache, AnalysisCache};
use super::cost::{CostSettings, CostTracker};
use super::provider::{build_provider, parse_json_content, AnalysisProvider};
use super::Analysis;
use crate::config::AiConfig;
use crate::error::AnalysisError;
use crate::model::{Finding, Level};

/// Longest normalized signature used for cache keys
pub const MAX_SIGNATURE_CHARS: usize = 500;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));
static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\b").expect("valid number pattern"));
static STRINGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"'[^']*'").expect("valid string pattern"));

/// Canonical form of a query: whitespace collapsed, literals replaced with
/// `?`, quotes dropped, lowercased, bounded length.
pub fn normalize_query(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    let numbers = NUMBERS.replace_all(&collapsed, "?");
    let strings = STRINGS.replace_all(&numbers, "?");
    let unquoted: String = strings.chars().filter(|c| !matches!(c, '"' | '\'' | '`')).collect();
    unquoted
        .trim()
        .to_lowercase()
        .chars()
        .take(MAX_SIGNATURE_CHARS)
        .collect()
}

/// Hex SHA-256 of the normalized signature
pub fn cache_key(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_query(text).as_bytes()))
}

/// Which findings are analyzed and what is asked
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub on_level: Vec<Level>,
    pub min_execution_time_ms: u64,
    pub root_cause: bool,
    pub optimization: bool,
    pub cache_ttl: Duration,
}

impl From<&AiConfig> for EngineSettings {
    fn from(config: &AiConfig) -> Self {
        Self {
            on_level: config.triggers.on_level.clone(),
            min_execution_time_ms: config.triggers.min_execution_time,
            root_cause: config.features.root_cause_analysis,
            optimization: config.features.optimization_suggestion,
            cache_ttl: Duration::from_secs(config.cache.ttl_seconds),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub enabled: bool,
    pub calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub total_cost: f64,
}

struct ActiveEngine {
    provider: Arc<dyn AnalysisProvider>,
    cache: Arc<dyn AnalysisCache>,
    cost: Arc<CostTracker>,
    settings: EngineSettings,
    calls: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// AI analysis entry point; a disabled engine answers `None` to everything
pub struct AnalysisEngine {
    active: Option<ActiveEngine>,
}

impl AnalysisEngine {
    pub fn disabled() -> Self {
        Self { active: None }
    }

    pub fn new(
        provider: Arc<dyn AnalysisProvider>,
        cache: Arc<dyn AnalysisCache>,
        cost: Arc<CostTracker>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            active: Some(ActiveEngine {
                provider,
                cache,
                cost,
                settings,
                calls: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Build from configuration; a missing key disables analysis instead of failing
    pub fn from_config(config: &AiConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let provider = match build_provider(config) {
            Ok(provider) => provider,
            Err(AnalysisError::MissingApiKey { provider }) => {
                warn!(provider = %provider, "No API key configured, AI analysis disabled");
                return Self::disabled();
            }
            Err(e) => {
                warn!(error = %e, "Failed to build analysis provider, AI analysis disabled");
                return Self::disabled();
            }
        };

        info!(
            provider = provider.name(),
            model = provider.model(),
            cache = ?config.cache.kind,
            "AI analysis enabled"
        );

        Self::new(
            provider,
            build_cache(&config.cache),
            Arc::new(CostTracker::new(CostSettings::from(config))),
            EngineSettings::from(config),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    pub fn cost_tracker(&self) -> Option<&Arc<CostTracker>> {
        self.active.as_ref().map(|a| &a.cost)
    }

    pub fn cache(&self) -> Option<&Arc<dyn AnalysisCache>> {
        self.active.as_ref().map(|a| &a.cache)
    }

    /// Whether `finding` meets the level and execution-time triggers
    pub fn should_analyze(&self, finding: &Finding) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        active.settings.on_level.contains(&finding.level)
            && finding.metrics.execution_time_ms.unwrap_or(0) >= active.settings.min_execution_time_ms
    }

    /// Analyze a finding, or `None` when disabled, not triggered, over
    /// budget, or the provider failed.
    pub async fn analyze(&self, finding: &Finding) -> Option<Analysis> {
        let active = self.active.as_ref()?;
        if !self.should_analyze(finding) {
            return None;
        }

        let signature = finding.query_text.as_deref().unwrap_or(&finding.message);
        let key = cache_key(signature);

        if let Some(mut cached) = active.cache.get(&key).await {
            active.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Analysis served from cache");
            cached.cached = true;
            return Some(cached);
        }
        active.misses.fetch_add(1, Ordering::Relaxed);

        let Some(permit) = active.cost.try_acquire() else {
            info!(finding_type = %finding.finding_type, "Analysis skipped, budget exhausted");
            return None;
        };

        let mut tokens = 0;
        let mut model = active.provider.model().to_string();
        let mut root_cause = None;
        let mut optimization = None;

        if active.settings.root_cause {
            match active.provider.complete(&root_cause_prompt(finding)).await {
                Ok(completion) => {
                    tokens += completion.tokens;
                    model = completion.model;
                    root_cause = Some(parse_json_content(&completion.content));
                }
                Err(e) => warn!(error = %e, "Root cause analysis failed"),
            }
        }

        if active.settings.optimization {
            match active.provider.complete(&optimization_prompt(finding)).await {
                Ok(completion) => {
                    tokens += completion.tokens;
                    model = completion.model;
                    optimization = Some(parse_json_content(&completion.content));
                }
                Err(e) => warn!(error = %e, "Optimization analysis failed"),
            }
        }

        if root_cause.is_none() && optimization.is_none() {
            // nothing was billed; the permit releases its slot on drop
            return None;
        }

        let analysis = Analysis {
            root_cause,
            optimization,
            model: model.clone(),
            tokens,
            analyzed_at: Utc::now(),
            cached: false,
        };

        active
            .cache
            .set(&key, &analysis, active.settings.cache_ttl)
            .await;
        let cost = permit.commit(tokens, &model);
        active.calls.fetch_add(1, Ordering::Relaxed);
        debug!(tokens, cost, model = %model, "Analysis completed");

        Some(analysis)
    }

    pub fn stats(&self) -> EngineStats {
        let Some(active) = &self.active else {
            return EngineStats::default();
        };
        let hits = active.hits.load(Ordering::Relaxed);
        let misses = active.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        EngineStats {
            enabled: true,
            calls: active.calls.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            total_cost: active.cost.stats().lifetime_cost,
        }
    }
}

fn describe_finding(finding: &Finding) -> String {
    let mut lines = vec![
        format!("Alert type: {}", finding.finding_type),
        format!("Severity: {}", finding.level),
        format!("Summary: {}", finding.message),
    ];
    if let Some(database) = &finding.database {
        lines.push(format!("Database: {}", database));
    }
    let metrics = &finding.metrics;
    if let Some(ms) = metrics.execution_time_ms {
        lines.push(format!("Execution time: {} ms", ms));
    }
    if let Some(ms) = metrics.cpu_time_ms {
        lines.push(format!("CPU time: {} ms", ms));
    }
    if let Some(reads) = metrics.logical_reads {
        lines.push(format!("Logical reads: {}", reads));
    }
    if let Some(wait) = &metrics.wait_type {
        lines.push(format!("Wait type: {}", wait));
    }
    if let Some(blocker) = metrics.blocking_session_id {
        lines.push(format!("Blocked by session: {}", blocker));
    }
    if let Some(plan) = &finding.execution_plan_summary {
        lines.push(format!(
            "Plan operators: {} table scans, {} index scans, {} index seeks",
            plan.table_scans, plan.index_scans, plan.index_seeks
        ));
    }
    if let Some(query) = &finding.query_text {
        lines.push(format!("Query:\n{}", query));
    }
    lines.join("\n")
}

fn root_cause_prompt(finding: &Finding) -> String {
    format!(
        "You are a database performance expert. Identify the most likely root cause of this alert.\n\n{}\n\n\
         Respond with JSON only: {{\"cause\": string, \"evidence\": [string], \"confidence\": number between 0 and 1}}",
        describe_finding(finding)
    )
}

fn optimization_prompt(finding: &Finding) -> String {
    format!(
        "You are a database performance expert. Suggest concrete optimizations for this alert.\n\n{}\n\n\
         Respond with JSON only: {{\"suggestions\": [string], \"indexRecommendations\": [string], \"rewrittenQuery\": string or null}}",
        describe_finding(finding)
    )
}
