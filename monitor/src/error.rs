//! Error handling for the DBSentinel monitor
//!
//! This module provides the error types for every monitor operation:
//! data-source access, configuration, lock-history persistence, AI analysis,
//! analysis caching and notification delivery.

use std::io;

use thiserror::Error;

/// The main error type for the monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Data source related errors
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Lock history persistence errors
    #[error("Lock history error: {0}")]
    History(#[from] HistoryError),

    /// AI analysis errors
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Analysis cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Notification delivery errors
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Data source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Query {query} failed: {reason}")]
    QueryFailed { query: String, reason: String },

    #[error("Query {query} timed out after {seconds}s")]
    Timeout { query: String, seconds: u64 },

    #[error("Malformed rows for {query}: {reason}")]
    MalformedRows { query: String, reason: String },

    #[error("Data source is closed")]
    Closed,
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration file permission denied: {path}")]
    PermissionDenied { path: String },
}

/// Lock history persistence errors
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Snapshot write failed for {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Snapshot read failed for {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },
}

/// AI analysis errors
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned status {status}: {body}")]
    BadStatus {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} returned an unreadable response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Missing API key for provider {provider}")]
    MissingApiKey { provider: String },
}

/// Analysis cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache entry could not be decoded: {reason}")]
    Decode { reason: String },
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Channel {channel} send failed: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("Channel {channel} rejected payload with status {status}")]
    Rejected { channel: String, status: u16 },

    #[error("Channel {channel} is misconfigured: {reason}")]
    Misconfigured { channel: String, reason: String },

    #[error("Alert log write failed: {reason}")]
    LogWriteFailed { reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MonitorError>;

/// A specialized result type for data source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for lock history operations
pub type HistoryResult<T> = std::result::Result<T, HistoryError>;

/// A specialized result type for analysis operations
pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;

/// A specialized result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// A specialized result type for notification operations
pub type NotifyResult<T> = std::result::Result<T, NotifyError>;

impl MonitorError {
    /// Check if this error is recoverable
    ///
    /// Only startup conditions (no connection, bad configuration) stop the
    /// daemon. Everything else is logged and the next tick proceeds.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Source(SourceError::ConnectionFailed { .. }) => false,
            MonitorError::Config(_) => false,
            _ => true,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Source(_) => "source",
            MonitorError::Config(_) => "config",
            MonitorError::History(_) => "history",
            MonitorError::Analysis(_) => "analysis",
            MonitorError::Cache(_) => "cache",
            MonitorError::Notify(_) => "notify",
            MonitorError::Io(_) => "io",
            MonitorError::Serialization(_) => "serialization",
            MonitorError::Generic(_) => "generic",
        }
    }
}

impl From<String> for MonitorError {
    fn from(msg: String) -> Self {
        MonitorError::Generic(msg)
    }
}

impl From<&str> for MonitorError {
    fn from(msg: &str) -> Self {
        MonitorError::Generic(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let source_error = MonitorError::Source(SourceError::ConnectionFailed {
            reason: "refused".to_string(),
        });
        assert_eq!(source_error.category(), "source");
        assert!(!source_error.is_recoverable());

        let query_error = MonitorError::Source(SourceError::QueryFailed {
            query: "runningOperations".to_string(),
            reason: "deadlock victim".to_string(),
        });
        assert!(query_error.is_recoverable());

        let notify_error = MonitorError::Notify(NotifyError::Rejected {
            channel: "ops-slack".to_string(),
            status: 500,
        });
        assert_eq!(notify_error.category(), "notify");
        assert!(notify_error.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let monitor_error = MonitorError::from("Test error".to_string());
        assert!(matches!(monitor_error, MonitorError::Generic(_)));

        let monitor_error = MonitorError::from("Test error");
        assert!(matches!(monitor_error, MonitorError::Generic(_)));
    }
}
