//! AI-assisted root-cause analysis
//!
//! The engine is the only entry point used by the dispatcher. Vendors and
//! cache backends sit behind small traits and are chosen once, at
//! construction.

mod cache;
mod cost;
mod engine;
mod provider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use cache::{build_cache, AnalysisCache, CacheStats, MemoryCache};
#[cfg(feature = "redis-cache")]
pub use cache::RedisCache;
pub use cost::{CallPermit, CostSettings, CostStats, CostTracker, DEFAULT_PRICE_PER_1K};
pub use engine::{cache_key, normalize_query, AnalysisEngine, EngineSettings, EngineStats};
pub use provider::{
    build_provider, parse_json_content, AnalysisProvider, AnthropicProvider, Completion,
    OpenAiProvider,
};

/// Result of analyzing one finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    /// Parsed JSON when the provider returned JSON, raw text otherwise
    pub root_cause: Option<Value>,
    pub optimization: Option<Value>,
    pub model: String,
    pub tokens: u64,
    pub analyzed_at: DateTime<Utc>,
    /// Served from cache
    #[serde(default)]
    pub cached: bool,
}
