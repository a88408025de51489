//! Execution status store.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Completed,
    Errored,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Errored => "errored",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Started)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persists execution status.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn upsert(&self, record: ExecutionRecord) -> Result<()>;

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>>;
}

/// Records kept by [`InMemoryExecutionStore::new`].
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// [`ExecutionStore`] backed by a map, for tests and single-process use.
///
/// Holds at most `max_records` finished executions; the oldest finished
/// record is evicted first. Started records are never evicted, so the map
/// can exceed the cap only by the number of executions still running.
#[derive(Debug)]
pub struct InMemoryExecutionStore {
    inner: RwLock<Records>,
    max_records: usize,
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<String, ExecutionRecord>,
    order: VecDeque<String>,
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            inner: RwLock::new(Records::default()),
            max_records: max_records.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Records {
    fn evict_finished(&mut self, max_records: usize) {
        while self.by_id.len() > max_records {
            let Some(pos) = self
                .order
                .iter()
                .position(|id| self.by_id.get(id).is_some_and(|r| r.status.is_terminal()))
            else {
                return;
            };
            if let Some(id) = self.order.remove(pos) {
                self.by_id.remove(&id);
            }
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn upsert(&self, record: ExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write();
        let id = record.execution_id.clone();
        if inner.by_id.insert(id.clone(), record).is_none() {
            inner.order.push_back(id);
        }
        inner.evict_finished(self.max_records);
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.inner.read().by_id.get(execution_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ExecutionStatus::Completed.to_string(), "completed");
        assert_eq!(ExecutionStatus::Errored.to_string(), "errored");
        assert_eq!(ExecutionStatus::Timeout.to_string(), "timeout");
        assert!(!ExecutionStatus::Started.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = InMemoryExecutionStore::new();
        let mut record = ExecutionRecord {
            execution_id: "exec-1".to_string(),
            workflow_id: "wf".to_string(),
            status: ExecutionStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        store.upsert(record.clone()).await.unwrap();

        record.status = ExecutionStatus::Completed;
        record.finished_at = Some(Utc::now());
        store.upsert(record).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get("exec-1").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(store.get("exec-2").await.unwrap().is_none());
    }

    fn record(id: &str, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.to_string(),
            workflow_id: "wf".to_string(),
            status,
            started_at: Utc::now(),
            finished_at: status.is_terminal().then(Utc::now),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_evicts_oldest_finished_records() {
        let store = InMemoryExecutionStore::with_max_records(2);

        store.upsert(record("running", ExecutionStatus::Started)).await.unwrap();
        store.upsert(record("done-1", ExecutionStatus::Completed)).await.unwrap();
        store.upsert(record("done-2", ExecutionStatus::Errored)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("running").await.unwrap().is_some());
        assert!(store.get("done-1").await.unwrap().is_none());
        assert!(store.get("done-2").await.unwrap().is_some());

        store.upsert(record("running-2", ExecutionStatus::Started)).await.unwrap();
        assert!(store.get("done-2").await.unwrap().is_none());

        // Only started records left over the cap: kept until they finish.
        store.upsert(record("running-3", ExecutionStatus::Started)).await.unwrap();
        assert_eq!(store.len(), 3);

        store.upsert(record("running", ExecutionStatus::Timeout)).await.unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("running").await.unwrap().is_none());
    }
}
