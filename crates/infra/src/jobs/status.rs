//! One-shot job status lookup.

use tracing::debug;

use snapvault_core::{BackendJob, JobId};

use crate::backend::{BackendError, StorageSession};

/// Current status of `job_id` as the backend reports it.
///
/// Opens a watch, takes the first update for this job and cancels the watch
/// by dropping it, so no further updates are delivered.
pub async fn first_status(
    session: &dyn StorageSession,
    job_id: &JobId,
) -> Result<BackendJob, BackendError> {
    let mut watch = session.watch_jobs(job_id).await?;

    while let Some(job) = watch.recv().await {
        if &job.id == job_id {
            debug!(job_id = %job_id, status = %job.status, "job status observed");
            return Ok(job);
        }
    }
    Err(BackendError::WatchClosed(job_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, StorageBackend};
    use snapvault_core::JobStatus;
    use url::Url;

    #[tokio::test]
    async fn reports_current_status_once() {
        let backend = InMemoryBackend::new().with_initial_status(JobStatus::Queued);
        let session = backend
            .create_session(&Url::parse("http://0.0.0.0:6002").unwrap())
            .await
            .unwrap();
        let cid = session.stage(b"snapshot".to_vec()).await.unwrap();
        let job_id = session.push_storage_config(&cid).await.unwrap();

        let job = first_status(session.as_ref(), &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.cid, cid);

        backend.set_job_status(&job_id, JobStatus::Executing).unwrap();
        let job = first_status(session.as_ref(), &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executing);
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let backend = InMemoryBackend::new();
        let session = backend
            .create_session(&Url::parse("http://0.0.0.0:6002").unwrap())
            .await
            .unwrap();

        let err = first_status(session.as_ref(), &JobId::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
