//! Scripted in-memory adapter for tests and dry runs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CheckQuery, DataSource, Row, RowScript};
use crate::error::{SourceError, SourceResult};

#[derive(Default)]
struct Script {
    rows: RowScript,
    failures: HashMap<CheckQuery, VecDeque<String>>,
    delays: HashMap<CheckQuery, Duration>,
    calls: HashMap<CheckQuery, usize>,
}

/// Returns configured rows for each query until they are replaced.
///
/// One-shot failures are queued per query and consumed in order before the
/// rows are served again.
#[derive(Default)]
pub struct MemorySource {
    script: Mutex<Script>,
    refuse_connect: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rows(&self, query: CheckQuery, rows: Vec<Row>) {
        self.lock().rows.insert(query, rows);
    }

    pub fn clear_rows(&self, query: CheckQuery) {
        self.lock().rows.remove(&query);
    }

    /// Make the next call for `query` fail
    pub fn push_failure(&self, query: CheckQuery, reason: impl Into<String>) {
        self.lock()
            .failures
            .entry(query)
            .or_default()
            .push_back(reason.into());
    }

    /// Delay every call for `query`
    pub fn set_delay(&self, query: CheckQuery, delay: Duration) {
        self.lock().delays.insert(query, delay);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn calls(&self, query: CheckQuery) -> usize {
        self.lock().calls.get(&query).copied().unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn connect(&self) -> SourceResult<()> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(SourceError::ConnectionFailed {
                reason: "connection refused".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_check_query(&self, query: CheckQuery) -> SourceResult<Vec<Row>> {
        if self.is_closed() {
            return Err(SourceError::Closed);
        }

        let (delay, failure, rows) = {
            let mut script = self.lock();
            *script.calls.entry(query).or_insert(0) += 1;
            let failure = script.failures.get_mut(&query).and_then(VecDeque::pop_front);
            (
                script.delays.get(&query).copied(),
                failure,
                script.rows.get(&query).cloned().unwrap_or_default(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(reason) => Err(SourceError::QueryFailed {
                query: query.id().to_string(),
                reason,
            }),
            None => Ok(rows),
        }
    }

    async fn close(&self) -> SourceResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fields;

    #[tokio::test]
    async fn test_scripted_rows_and_failures() {
        let source = MemorySource::new();
        source.set_rows(
            CheckQuery::RunningOperations,
            vec![Row::new().with(fields::SESSION_ID, 51)],
        );
        source.push_failure(CheckQuery::RunningOperations, "deadlock victim");

        assert!(source.run_check_query(CheckQuery::RunningOperations).await.is_err());
        let rows = source.run_check_query(CheckQuery::RunningOperations).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(source.calls(CheckQuery::RunningOperations), 2);

        assert!(source.run_check_query(CheckQuery::UnusedIndexes).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let source = MemorySource::new();
        source.refuse_connect(true);
        assert!(matches!(source.connect().await, Err(SourceError::ConnectionFailed { .. })));

        source.refuse_connect(false);
        source.connect().await.unwrap();
        assert!(source.is_connected());

        source.close().await.unwrap();
        assert!(source.is_closed());
        assert!(matches!(
            source.run_check_query(CheckQuery::BlockingPairs).await,
            Err(SourceError::Closed)
        ));
    }
}
