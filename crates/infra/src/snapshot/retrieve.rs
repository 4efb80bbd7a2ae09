//! Snapshot retrieval.
//!
//! Every registry record for an address is fetched and rebuilt into a log.
//! Fetches run concurrently but results keep registry order, and the first
//! failing job aborts the whole retrieval.

use std::time::Duration;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::{debug, info};

use snapvault_core::{Cid, DbAddress, JobRecord};

use crate::backend::{BackendError, StorageSession};
use crate::jobs::{JobRegistry, RegistryError};
use crate::log_store::{Log, LogSnapshot, LogStore, LogStoreError, ReconstructOptions};

/// Upper bound on blobs fetched at once.
pub const RETRIEVE_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("blob {cid} is not a log snapshot: {source}")]
    Decode {
        cid: Cid,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] LogStoreError),
}

/// A stored job paired with the log rebuilt from its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub job: JobRecord,
    pub log: Log,
}

/// Registry records whose snapshot came from `address`.
pub async fn matching_jobs(
    registry: &JobRegistry,
    address: &DbAddress,
) -> Result<Vec<JobRecord>, RetrieveError> {
    registry.load().await?;
    let jobs = registry.find_by_db_address(address).await?;
    info!(db_address = %address, jobs = jobs.len(), "retrieving snapshots");
    Ok(jobs)
}

/// Lazily fetch and rebuild the snapshot of every job in `jobs`.
pub fn materialize_all<'a>(
    log_store: &'a dyn LogStore,
    session: &'a dyn StorageSession,
    jobs: Vec<JobRecord>,
    reconstruct_timeout: Duration,
) -> impl Stream<Item = Result<Snapshot, RetrieveError>> + Send + 'a {
    stream::iter(jobs)
        .map(move |job| materialize_one(log_store, session, job, reconstruct_timeout))
        .buffered(RETRIEVE_CONCURRENCY)
}

/// Fetch every snapshot stored for `address`, failing on the first bad one.
pub async fn retrieve_snapshot(
    log_store: &dyn LogStore,
    session: &dyn StorageSession,
    registry: &JobRegistry,
    address: &DbAddress,
    reconstruct_timeout: Duration,
) -> Result<Vec<Snapshot>, RetrieveError> {
    let jobs = matching_jobs(registry, address).await?;
    materialize_all(log_store, session, jobs, reconstruct_timeout)
        .try_collect()
        .await
}

async fn materialize_one(
    log_store: &dyn LogStore,
    session: &dyn StorageSession,
    job: JobRecord,
    reconstruct_timeout: Duration,
) -> Result<Snapshot, RetrieveError> {
    let bytes = session.get(&job.cid).await?;
    let snapshot: LogSnapshot =
        serde_json::from_slice(&bytes).map_err(|source| RetrieveError::Decode {
            cid: job.cid.clone(),
            source,
        })?;

    let options = ReconstructOptions {
        length: None,
        timeout: reconstruct_timeout,
    };
    let log = tokio::time::timeout(reconstruct_timeout, log_store.materialize(snapshot, options))
        .await
        .map_err(|_| LogStoreError::Timeout(reconstruct_timeout))??;

    debug!(job_id = %job.id, cid = %job.cid, entries = log.len(), "snapshot rebuilt");
    Ok(Snapshot { job, log })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::{InMemoryBackend, StorageBackend};
    use crate::log_store::{InMemoryLogStore, LamportClock, LogEntry, ReplicationNetwork};
    use snapvault_core::{BackendJob, JobId, JobStatus};
    use url::Url;

    const ADDRESS: &str = "/orbitdb/zdpuA/events";

    fn snapshot_bytes(n: usize) -> Vec<u8> {
        let mut log = Log::new(ADDRESS);
        for i in 0..n {
            let next = log.heads().into_iter().map(|e| e.hash.clone()).collect();
            let clock = LamportClock {
                id: "writer".into(),
                time: log.max_time() + 1,
            };
            log.insert(LogEntry::new(ADDRESS, serde_json::json!(format!("entry{i}")), next, clock))
                .unwrap();
        }
        serde_json::to_vec(&log.to_snapshot()).unwrap()
    }

    struct Fixture {
        session: Arc<dyn StorageSession>,
        store: InMemoryLogStore,
        registry: JobRegistry,
    }

    async fn fixture() -> Fixture {
        let backend = InMemoryBackend::new();
        let session = backend
            .create_session(&Url::parse("http://0.0.0.0:6002").unwrap())
            .await
            .unwrap();
        let store = InMemoryLogStore::new("orchestrator", ReplicationNetwork::new());
        let registry = JobRegistry::open(&store, "jobs").await.unwrap();
        Fixture {
            session,
            store,
            registry,
        }
    }

    async fn record_blob(f: &Fixture, id: &str, address: &str, bytes: Vec<u8>) -> JobRecord {
        let cid = f.session.stage(bytes).await.unwrap();
        let record = JobRecord::stitch(
            BackendJob {
                id: JobId::new(id).unwrap(),
                cid,
                status: JobStatus::Executing,
                err_cause: String::new(),
                deal_errors: Vec::new(),
            },
            DbAddress::new(address).unwrap(),
        );
        f.registry.upsert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn returns_every_match_in_registry_order() {
        let f = fixture().await;
        let first = record_blob(&f, "job-1", ADDRESS, snapshot_bytes(3)).await;
        record_blob(&f, "job-2", "/orbitdb/zdpuB/other", snapshot_bytes(1)).await;
        let third = record_blob(&f, "job-3", ADDRESS, snapshot_bytes(5)).await;

        let snapshots = retrieve_snapshot(
            &f.store,
            f.session.as_ref(),
            &f.registry,
            &DbAddress::new(ADDRESS).unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].job, first);
        assert_eq!(snapshots[0].log.len(), 3);
        assert_eq!(snapshots[1].job, third);
        assert_eq!(snapshots[1].log.len(), 5);
        assert_eq!(snapshots[1].log.id(), ADDRESS);
    }

    #[tokio::test]
    async fn unknown_address_yields_nothing() {
        let f = fixture().await;
        record_blob(&f, "job-1", ADDRESS, snapshot_bytes(2)).await;

        let snapshots = retrieve_snapshot(
            &f.store,
            f.session.as_ref(),
            &f.registry,
            &DbAddress::new("/orbitdb/zdpuC/none").unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(snapshots.is_empty());
    }

    #[tokio::test]
    async fn one_corrupt_blob_fails_the_call() {
        let f = fixture().await;
        record_blob(&f, "job-1", ADDRESS, snapshot_bytes(2)).await;
        record_blob(&f, "job-2", ADDRESS, b"not json".to_vec()).await;

        let err = retrieve_snapshot(
            &f.store,
            f.session.as_ref(),
            &f.registry,
            &DbAddress::new(ADDRESS).unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RetrieveError::Decode { .. }));
    }

    #[tokio::test]
    async fn stream_is_restartable() {
        let f = fixture().await;
        let record = record_blob(&f, "job-1", ADDRESS, snapshot_bytes(2)).await;
        let address = DbAddress::new(ADDRESS).unwrap();

        for _ in 0..2 {
            let jobs = matching_jobs(&f.registry, &address).await.unwrap();
            let mut stream = Box::pin(materialize_all(
                &f.store,
                f.session.as_ref(),
                jobs,
                Duration::from_secs(1),
            ));
            let snapshot = stream.next().await.unwrap().unwrap();
            assert_eq!(snapshot.job, record);
            assert!(stream.next().await.is_none());
        }
    }
}
