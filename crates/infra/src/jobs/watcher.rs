//! Background reconciliation of job status into the registry.
//!
//! One loop per submitted job. Each tick reloads the registry, asks the
//! backend for the job's current status and writes the record back only when
//! the status changed. A failing tick is logged and the loop carries on.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapvault_core::{JobId, JobRecord, JobStatus};

use super::registry::{JobRegistry, RegistryError};
use super::status::first_status;
use crate::backend::{BackendError, StorageSession};
use crate::poll::PollPolicy;

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcilePolicy {
    pub poll: PollPolicy,
    /// End the loop once the job reaches a terminal status.
    pub stop_on_terminal: bool,
}

impl ReconcilePolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.poll.deadline = Some(deadline);
        self
    }

    pub fn with_stop_on_terminal(mut self, stop: bool) -> Self {
        self.stop_on_terminal = stop;
        self
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of one reconciliation tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Backend status matches the stored record; nothing written.
    Unchanged(JobStatus),
    /// The stored record was replaced.
    Updated(JobRecord),
}

impl ReconcileOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            ReconcileOutcome::Unchanged(status) => *status,
            ReconcileOutcome::Updated(record) => record.status,
        }
    }
}

/// Bring the stored record for `job_id` in line with the backend.
pub async fn reconcile_once(
    session: &dyn StorageSession,
    registry: &JobRegistry,
    job_id: &JobId,
) -> Result<ReconcileOutcome, ReconcileError> {
    registry.load().await?;
    let stored = registry.require(job_id).await?;
    let fresh = first_status(session, job_id).await?;

    match stored.reconcile(fresh) {
        None => Ok(ReconcileOutcome::Unchanged(stored.status)),
        Some(updated) => {
            registry.upsert(&updated).await?;
            info!(
                job_id = %job_id,
                from = %stored.status,
                to = %updated.status,
                db_address = %updated.db_address,
                "job status reconciled"
            );
            Ok(ReconcileOutcome::Updated(updated))
        }
    }
}

/// Owns every background task the orchestrator starts.
///
/// All tasks observe one cancellation token; [`WatcherSet::shutdown`] trips
/// it and waits for every task to finish.
#[derive(Debug, Default)]
pub struct WatcherSet {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a reconciliation loop for `job_id`.
    pub fn watch(
        &self,
        session: Arc<dyn StorageSession>,
        registry: JobRegistry,
        job_id: JobId,
        policy: ReconcilePolicy,
    ) {
        if self.refuse_after_shutdown() {
            return;
        }
        let cancel = self.cancel.clone();
        self.track(tokio::spawn(run_watch(session, registry, job_id, policy, cancel)));
    }

    /// Spawn `task`, abandoning it at shutdown.
    pub fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.refuse_after_shutdown() {
            return;
        }
        let cancel = self.cancel.clone();
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        }));
    }

    fn refuse_after_shutdown(&self) -> bool {
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!("watcher set is shut down; task not started");
        }
        cancelled
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .map(|h| h.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        self.cancel.cancelled().await
    }

    /// Cancel every task and wait until all of them have exited.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

async fn run_watch(
    session: Arc<dyn StorageSession>,
    registry: JobRegistry,
    job_id: JobId,
    policy: ReconcilePolicy,
    cancel: CancellationToken,
) {
    info!(job_id = %job_id, interval = ?policy.poll.interval, "job watch started");

    let started = Instant::now();
    let mut ticker = tokio::time::interval(policy.poll.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(limit) = policy.poll.deadline {
            if started.elapsed() > limit {
                info!(job_id = %job_id, "job watch deadline reached");
                break;
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = reconcile_once(session.as_ref(), &registry, &job_id) => outcome,
        };

        match outcome {
            Ok(outcome) => {
                debug!(job_id = %job_id, status = %outcome.status(), "job watch tick");
                if policy.stop_on_terminal && outcome.status().is_terminal() {
                    info!(job_id = %job_id, status = %outcome.status(), "job reached terminal status");
                    break;
                }
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "job reconciliation failed"),
        }
    }

    info!(job_id = %job_id, "job watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, StorageBackend};
    use crate::log_store::in_memory::InMemoryDocumentStore;
    use snapvault_core::DbAddress;
    use url::Url;

    struct Fixture {
        backend: InMemoryBackend,
        session: Arc<dyn StorageSession>,
        docs: Arc<InMemoryDocumentStore>,
        registry: JobRegistry,
        record: JobRecord,
    }

    async fn fixture() -> Fixture {
        let backend = InMemoryBackend::new();
        let session = backend
            .create_session(&Url::parse("http://0.0.0.0:6002").unwrap())
            .await
            .unwrap();
        let cid = session.stage(b"snapshot".to_vec()).await.unwrap();
        let job_id = session.push_storage_config(&cid).await.unwrap();

        let docs = Arc::new(InMemoryDocumentStore::new("jobs", "id"));
        let registry = JobRegistry::from_store(docs.clone());
        let job = first_status(session.as_ref(), &job_id).await.unwrap();
        let record = JobRecord::stitch(job, DbAddress::new("/orbitdb/zdpuA/events").unwrap());
        registry.upsert(&record).await.unwrap();

        Fixture {
            backend,
            session,
            docs,
            registry,
            record,
        }
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let f = fixture().await;
        let writes = f.docs.write_count();

        let outcome = reconcile_once(f.session.as_ref(), &f.registry, &f.record.id)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged(JobStatus::Executing));
        assert_eq!(f.docs.write_count(), writes);
    }

    #[tokio::test]
    async fn changed_status_keeps_db_address() {
        let f = fixture().await;
        f.backend
            .fail_job(&f.record.id, "deal rejected", Vec::new())
            .unwrap();

        let outcome = reconcile_once(f.session.as_ref(), &f.registry, &f.record.id)
            .await
            .unwrap();
        let ReconcileOutcome::Updated(updated) = outcome else {
            panic!("expected an update");
        };

        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.err_cause, "deal rejected");
        assert_eq!(updated.db_address, f.record.db_address);
        assert_eq!(f.registry.require(&f.record.id).await.unwrap(), updated);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_picks_up_transitions() {
        let f = fixture().await;
        let watchers = WatcherSet::new();
        watchers.watch(
            f.session.clone(),
            f.registry.clone(),
            f.record.id.clone(),
            ReconcilePolicy::default(),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        let writes = f.docs.write_count();

        f.backend
            .set_job_status(&f.record.id, JobStatus::Success)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stored = f.registry.require(&f.record.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.db_address, f.record.db_address);
        assert_eq!(f.docs.write_count(), writes + 1);

        watchers.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_on_terminal_ends_the_loop() {
        let f = fixture().await;
        let watchers = WatcherSet::new();
        watchers.watch(
            f.session.clone(),
            f.registry.clone(),
            f.record.id.clone(),
            ReconcilePolicy::default().with_stop_on_terminal(true),
        );

        f.backend
            .set_job_status(&f.record.id, JobStatus::Success)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(watchers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_writes_after_shutdown() {
        let f = fixture().await;
        let watchers = WatcherSet::new();
        watchers.watch(
            f.session.clone(),
            f.registry.clone(),
            f.record.id.clone(),
            ReconcilePolicy::default(),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;

        watchers.shutdown().await;
        let writes = f.docs.write_count();

        f.backend
            .set_job_status(&f.record.id, JobStatus::Success)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(f.docs.write_count(), writes);
        assert!(watchers.is_shut_down());
        assert!(watchers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_ticks_do_not_end_the_loop() {
        let f = fixture().await;
        let watchers = WatcherSet::new();
        watchers.watch(
            f.session.clone(),
            f.registry.clone(),
            f.record.id.clone(),
            ReconcilePolicy::default(),
        );

        f.backend.set_reachable(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(watchers.len(), 1);

        f.backend.set_reachable(true);
        f.backend
            .set_job_status(&f.record.id, JobStatus::Success)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(
            f.registry.require(&f.record.id).await.unwrap().status,
            JobStatus::Success
        );
        watchers.shutdown().await;
    }
}
