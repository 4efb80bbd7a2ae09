//! Durable job registry backed by a log-store document store.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use snapvault_core::{DbAddress, JobId, JobRecord};

use crate::log_store::{DocumentStore, LogStore, LogStoreError};

/// Document field every job record is keyed by.
pub const INDEX_BY: &str = "id";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] LogStoreError),

    #[error("job record failed to decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no job record for {0}")]
    NotFound(JobId),
}

/// Every archival job ever submitted, keyed by job id.
#[derive(Clone)]
pub struct JobRegistry {
    docs: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("name", &self.docs.name())
            .finish()
    }
}

impl JobRegistry {
    /// Open (or create) the registry document store `name` and load it.
    pub async fn open(log_store: &dyn LogStore, name: &str) -> Result<Self, RegistryError> {
        let docs = log_store.docs(name, INDEX_BY).await?;
        docs.load().await?;
        Ok(Self { docs })
    }

    pub fn from_store(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub fn name(&self) -> &str {
        self.docs.name()
    }

    pub fn index_by(&self) -> &str {
        self.docs.index_by()
    }

    /// Refresh the local view from the persistent store.
    pub async fn load(&self) -> Result<(), RegistryError> {
        Ok(self.docs.load().await?)
    }

    pub async fn upsert(&self, record: &JobRecord) -> Result<(), RegistryError> {
        let doc = serde_json::to_value(record)?;
        self.docs.put(doc).await?;
        debug!(job_id = %record.id, status = %record.status, "job record written");
        Ok(())
    }

    /// Records stored under `job_id` (zero or one).
    pub async fn get(&self, job_id: &JobId) -> Result<Vec<JobRecord>, RegistryError> {
        decode_all(self.docs.get(job_id.as_str()).await?)
    }

    /// The single record for `job_id`.
    pub async fn require(&self, job_id: &JobId) -> Result<JobRecord, RegistryError> {
        self.get(job_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::NotFound(job_id.clone()))
    }

    /// Every record whose snapshot came from `db_address`, in insertion order.
    pub async fn find_by_db_address(
        &self,
        db_address: &DbAddress,
    ) -> Result<Vec<JobRecord>, RegistryError> {
        let target = db_address.as_str();
        decode_all(
            self.docs
                .query(&|doc: &JsonValue| doc.get("dbAddress").and_then(JsonValue::as_str) == Some(target))
                .await?,
        )
    }

    /// Every record matching `predicate`.
    pub async fn find_by<P>(&self, predicate: P) -> Result<Vec<JobRecord>, RegistryError>
    where
        P: Fn(&JobRecord) -> bool + Send + Sync,
    {
        let matches = |doc: &JsonValue| {
            serde_json::from_value::<JobRecord>(doc.clone())
                .map(|r| predicate(&r))
                .unwrap_or(false)
        };
        decode_all(self.docs.query(&matches).await?)
    }
}

fn decode_all(docs: Vec<JsonValue>) -> Result<Vec<JobRecord>, RegistryError> {
    docs.into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(RegistryError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::{InMemoryLogStore, ReplicationNetwork};
    use snapvault_core::{BackendJob, Cid, JobStatus};

    fn record(id: &str, address: &str, status: JobStatus) -> JobRecord {
        JobRecord::stitch(
            BackendJob {
                id: JobId::new(id).unwrap(),
                cid: Cid::new(format!("bafk-{id}")).unwrap(),
                status,
                err_cause: String::new(),
                deal_errors: Vec::new(),
            },
            DbAddress::new(address).unwrap(),
        )
    }

    async fn registry() -> JobRegistry {
        let store = InMemoryLogStore::new("peer-a", ReplicationNetwork::new());
        JobRegistry::open(&store, "jobs").await.unwrap()
    }

    #[tokio::test]
    async fn registry_is_indexed_by_id() {
        let registry = registry().await;
        assert_eq!(registry.name(), "jobs");
        assert_eq!(registry.index_by(), "id");
    }

    #[tokio::test]
    async fn upsert_replaces_record_with_same_id() {
        let registry = registry().await;
        let first = record("job-1", "/orbitdb/zdpuA/a", JobStatus::Executing);
        registry.upsert(&first).await.unwrap();

        let mut second = first.clone();
        second.status = JobStatus::Success;
        registry.upsert(&second).await.unwrap();

        assert_eq!(registry.get(&first.id).await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn finds_every_job_for_an_address() {
        let registry = registry().await;
        registry
            .upsert(&record("job-1", "/orbitdb/zdpuA/a", JobStatus::Success))
            .await
            .unwrap();
        registry
            .upsert(&record("job-2", "/orbitdb/zdpuB/b", JobStatus::Executing))
            .await
            .unwrap();
        registry
            .upsert(&record("job-3", "/orbitdb/zdpuA/a", JobStatus::Executing))
            .await
            .unwrap();

        let found = registry
            .find_by_db_address(&DbAddress::new("/orbitdb/zdpuA/a").unwrap())
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["job-1", "job-3"]);

        let executing = registry
            .find_by(|r| r.status == JobStatus::Executing)
            .await
            .unwrap();
        assert_eq!(executing.len(), 2);
    }

    #[tokio::test]
    async fn require_reports_missing_job() {
        let registry = registry().await;
        let missing = JobId::new("job-x").unwrap();

        assert!(matches!(
            registry.require(&missing).await,
            Err(RegistryError::NotFound(id)) if id == missing
        ));
    }
}
