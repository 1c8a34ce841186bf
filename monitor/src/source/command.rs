//! Adapter that shells out to an external probe program per query

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CheckQuery, DataSource, Row};
use crate::error::{SourceError, SourceResult};

/// Runs `program args... <query-id>` and reads a JSON array of rows from stdout.
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    closed: AtomicBool,
}

impl CommandSource {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    async fn execute(&self, query: CheckQuery) -> SourceResult<Vec<Row>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(query.id())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| SourceError::Timeout {
                query: query.id().to_string(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| SourceError::QueryFailed {
                query: query.id().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::QueryFailed {
                query: query.id().to_string(),
                reason: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }

        parse_rows(query, &output.stdout)
    }
}

fn parse_rows(query: CheckQuery, stdout: &[u8]) -> SourceResult<Vec<Row>> {
    let trimmed = std::str::from_utf8(stdout)
        .map_err(|e| SourceError::MalformedRows {
            query: query.id().to_string(),
            reason: e.to_string(),
        })?
        .trim();

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(trimmed).map_err(|e| SourceError::MalformedRows {
        query: query.id().to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl DataSource for CommandSource {
    async fn connect(&self) -> SourceResult<()> {
        self.closed.store(false, Ordering::SeqCst);
        self.execute(CheckQuery::RunningOperations)
            .await
            .map(|_| ())
            .map_err(|e| SourceError::ConnectionFailed {
                reason: e.to_string(),
            })
    }

    async fn run_check_query(&self, query: CheckQuery) -> SourceResult<Vec<Row>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        let rows = self.execute(query).await?;
        debug!(query = %query, rows = rows.len(), "Check query completed");
        Ok(rows)
    }

    async fn close(&self) -> SourceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("command:{}", self.program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fields;

    #[test]
    fn test_parse_rows() {
        let rows = parse_rows(
            CheckQuery::RunningOperations,
            br#"[{"sessionId": 51, "elapsedMs": 1200, "text": "SELECT 1"}]"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].u64(fields::ELAPSED_MS), Some(1200));

        assert!(parse_rows(CheckQuery::RunningOperations, b"  \n").unwrap().is_empty());
        assert!(matches!(
            parse_rows(CheckQuery::RunningOperations, b"not json"),
            Err(SourceError::MalformedRows { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_is_parsed() {
        let source = CommandSource::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                r#"echo '[{"sessionId": 7, "query": "'"$0"'"}]'"#.to_string(),
            ],
            Duration::from_secs(5),
        );

        let rows = source.run_check_query(CheckQuery::BlockingPairs).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].i64(fields::SESSION_ID), Some(7));
        assert_eq!(rows[0].str("query"), Some("blockingPairs"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_probe_is_connection_failure() {
        let source = CommandSource::new(
            "sh".to_string(),
            vec!["-c".to_string(), "exit 3".to_string()],
            Duration::from_secs(5),
        );

        let result = source.connect().await;
        assert!(matches!(result, Err(SourceError::ConnectionFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let source = CommandSource::new(
            "sh".to_string(),
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );

        let result = source.run_check_query(CheckQuery::UnusedIndexes).await;
        assert!(matches!(result, Err(SourceError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_closed_source_refuses_queries() {
        let source = CommandSource::new("true".to_string(), Vec::new(), Duration::from_secs(1));
        source.close().await.unwrap();
        let result = source.run_check_query(CheckQuery::RunningOperations).await;
        assert!(matches!(result, Err(SourceError::Closed)));
    }
}
