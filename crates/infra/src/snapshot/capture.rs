//! Job submission.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use snapvault_core::{DbAddress, JobRecord};
use snapvault_events::{ConvergenceError, wait_for_convergence};

use crate::backend::{BackendError, StorageSession};
use crate::jobs::{JobRegistry, ReconcilePolicy, RegistryError, WatcherSet, first_status};
use crate::log_store::{LogDatabase, LogStore, LogStoreError};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] LogStoreError),

    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    #[error("snapshot failed to encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("capture abandoned: background work was shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureOptions {
    /// Abandon the capture if replication has not converged by then.
    pub convergence_deadline: Option<Duration>,
    pub reconcile: ReconcilePolicy,
}

/// Snapshot the database at `address` once it has converged, submit it as a
/// storage job and start reconciling that job.
///
/// The returned record is already persisted. The local replica is dropped
/// afterwards; a failed drop is logged and does not fail the call. Once
/// `watchers` is shut down the capture is abandoned without touching the
/// registry.
pub async fn store_snapshot(
    log_store: &dyn LogStore,
    session: &Arc<dyn StorageSession>,
    registry: &JobRegistry,
    watchers: &WatcherSet,
    address: &DbAddress,
    options: CaptureOptions,
) -> Result<JobRecord, SubmitError> {
    let db = log_store.open(address).await?;

    let capture = async {
        info!(db_address = %address, "waiting for replication to converge");
        wait_for_convergence(db.replication_events(), options.convergence_deadline).await?;
        info!(db_address = %address, "replication converged");
        let record = submit(db.as_ref(), session.as_ref(), registry).await?;
        Ok::<_, SubmitError>(record)
    };
    let record = tokio::select! {
        biased;
        _ = watchers.wait_for_shutdown() => {
            info!(db_address = %address, "capture abandoned at shutdown");
            return Err(SubmitError::ShutDown);
        }
        record = capture => record?,
    };

    watchers.watch(
        session.clone(),
        registry.clone(),
        record.id.clone(),
        options.reconcile,
    );

    if let Err(e) = db.drop_local().await {
        warn!(db_address = %address, error = %e, "failed to drop local replica");
    }
    Ok(record)
}

async fn submit(
    db: &dyn LogDatabase,
    session: &dyn StorageSession,
    registry: &JobRegistry,
) -> Result<JobRecord, SubmitError> {
    db.load().await?;
    let snapshot = db.export_snapshot().await?;
    let bytes = serde_json::to_vec(&snapshot)?;

    let cid = session.stage(bytes).await?;
    let job_id = session.push_storage_config(&cid).await?;
    info!(
        job_id = %job_id,
        cid = %cid,
        db_address = %db.address(),
        entries = snapshot.size(),
        "snapshot submitted"
    );

    let job = first_status(session, &job_id).await?;
    let record = JobRecord::stitch(job, db.address().clone());
    registry.upsert(&record).await?;
    Ok(record)
}
