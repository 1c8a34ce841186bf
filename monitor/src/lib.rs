//! DBSentinel monitor library
//!
//! This library provides the core of the DBSentinel daemon, which polls a
//! database's introspection views on a fixed interval, classifies what it
//! finds, tracks lock conflicts that persist across ticks and dispatches
//! throttled alerts with optional AI-assisted analysis.

pub mod ai;
pub mod checks;
pub mod config;
pub mod error;
pub mod locks;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod severity;
pub mod source;

// Re-export commonly used types
pub use ai::{Analysis, AnalysisEngine, CostTracker};
pub use checks::{Check, CheckContext, CheckSet};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use locks::{LockHistoryStore, LockTracker, SharedTracker};
pub use model::{Finding, FindingType, Level, ThresholdSet};
pub use notify::{Dispatcher, NotificationChannel};
pub use scheduler::{Monitor, MonitorSummary};
pub use severity::classify;
pub use source::{CheckQuery, DataSource, MemorySource, Row};
