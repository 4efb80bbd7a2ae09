//! The snapshot job orchestrator.
//!
//! Owns one storage session, one log-store session, the job registry and
//! every background task (the balance wait plus one reconciliation loop per
//! submitted job). [`Orchestrator::stop`] cancels all of them, then releases
//! the log store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use snapvault_core::{DbAddress, JobId, JobRecord, WalletAddress};

use crate::backend::{BackendError, StorageBackend, StorageSession};
use crate::config::OrchestratorConfig;
use crate::jobs::{JobRegistry, RegistryError, WatcherSet};
use crate::log_store::{LogStore, LogStoreConnector, LogStoreError};
use crate::provisioning::{ProvisionError, Provisioned, initialize, wait_for_balance};
use crate::snapshot::{
    CaptureOptions, RetrieveError, Snapshot, SubmitError, matching_jobs, materialize_all,
    retrieve_snapshot, store_snapshot,
};
use crate::transport::TransportOptions;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] LogStoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("wallet never became available: {0}")]
    WalletUnavailable(String),

    #[error("orchestrator is stopped")]
    Stopped,
}

/// Progress of the startup balance wait.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WalletState {
    Pending,
    Funded(WalletAddress),
    Failed(String),
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    session: Arc<dyn StorageSession>,
    funding_address: WalletAddress,
    transport: TransportOptions,
    log_store: Arc<dyn LogStore>,
    registry: JobRegistry,
    watchers: WatcherSet,
    wallet: watch::Receiver<WalletState>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("funding_address", &self.funding_address.addr)
            .field("registry", &self.registry)
            .field("watchers", &self.watchers.len())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Orchestrator {
    /// Provision a storage session and connect the log store through it.
    ///
    /// Returns as soon as the session, log store and registry are up. The
    /// funding balance is awaited in the background; see
    /// [`wallet`](Self::wallet) and [`wallet_ready`](Self::wallet_ready).
    pub async fn create(
        config: OrchestratorConfig,
        backend: &dyn StorageBackend,
        connector: &dyn LogStoreConnector,
    ) -> Result<Self, OrchestratorError> {
        let Provisioned {
            session,
            address,
            transport,
        } = initialize(backend, &config.endpoint, &config.default_address_name).await?;

        let log_store = connector.connect(&transport).await?;
        let registry = JobRegistry::open(log_store.as_ref(), &config.jobs_db_name).await?;

        let watchers = WatcherSet::new();
        let (wallet_tx, wallet_rx) = watch::channel(WalletState::Pending);
        {
            let session = session.clone();
            let address = address.clone();
            let threshold = config.balance_threshold;
            let policy = config.balance_poll;
            watchers.spawn_tracked(async move {
                let state =
                    match wait_for_balance(session.as_ref(), &address, threshold, policy).await {
                        Ok(wallet) => WalletState::Funded(wallet),
                        Err(e) => {
                            warn!(address = %address.addr, error = %e, "balance wait failed");
                            WalletState::Failed(e.to_string())
                        }
                    };
                let _ = wallet_tx.send(state);
            });
        }

        info!(
            endpoint = %config.endpoint,
            peer_id = %log_store.peer_id(),
            registry = %registry.name(),
            "orchestrator ready"
        );

        Ok(Self {
            config,
            session,
            funding_address: address,
            transport,
            log_store,
            registry,
            watchers,
            wallet: wallet_rx,
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Stopped);
        }
        Ok(())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Funded wallet, or `None` while the balance wait is still running.
    pub fn wallet(&self) -> Option<WalletAddress> {
        match &*self.wallet.borrow() {
            WalletState::Funded(wallet) => Some(wallet.clone()),
            _ => None,
        }
    }

    /// Wait for the startup balance wait to finish.
    pub async fn wallet_ready(&self) -> Result<WalletAddress, OrchestratorError> {
        let mut wallet = self.wallet.clone();
        let state = wallet
            .wait_for(|s| *s != WalletState::Pending)
            .await
            .map_err(|_| OrchestratorError::Stopped)?;

        match &*state {
            WalletState::Funded(wallet) => Ok(wallet.clone()),
            WalletState::Failed(reason) => Err(OrchestratorError::WalletUnavailable(reason.clone())),
            WalletState::Pending => Err(OrchestratorError::Stopped),
        }
    }

    /// The address provisioned at startup, as first reported.
    pub fn funding_address(&self) -> &WalletAddress {
        &self.funding_address
    }

    /// Every address held by the storage session, with current balances.
    pub async fn addresses(&self) -> Result<Vec<WalletAddress>, OrchestratorError> {
        self.ensure_running()?;
        Ok(self.session.addresses().await?)
    }

    /// Shared log-store handle.
    pub fn log_store(&self) -> Arc<dyn LogStore> {
        self.log_store.clone()
    }

    pub fn transport(&self) -> &TransportOptions {
        &self.transport
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Stored records for `job_id` (zero or one).
    pub async fn get_job_status(&self, job_id: &JobId) -> Result<Vec<JobRecord>, OrchestratorError> {
        self.ensure_running()?;
        Ok(self.registry.get(job_id).await?)
    }

    /// Capture the database at `address` once replication converges and
    /// submit it for archival.
    ///
    /// A capture still waiting when [`stop`](Self::stop) runs fails with
    /// [`OrchestratorError::Stopped`] and writes nothing.
    pub async fn store_snapshot(&self, address: &DbAddress) -> Result<JobRecord, OrchestratorError> {
        self.ensure_running()?;
        let options = CaptureOptions {
            convergence_deadline: self.config.convergence_deadline,
            reconcile: self.config.reconcile,
        };

        store_snapshot(
            self.log_store.as_ref(),
            &self.session,
            &self.registry,
            &self.watchers,
            address,
            options,
        )
        .await
        .map_err(|e| match e {
            SubmitError::ShutDown => OrchestratorError::Stopped,
            e => e.into(),
        })
    }

    /// Start (another) reconciliation loop for an already-registered job.
    pub fn watch_job(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        self.ensure_running()?;
        self.watchers.watch(
            self.session.clone(),
            self.registry.clone(),
            job_id,
            self.config.reconcile,
        );
        Ok(())
    }

    /// Every snapshot stored for `address`, in registry order.
    pub async fn retrieve_snapshot(
        &self,
        address: &DbAddress,
    ) -> Result<Vec<Snapshot>, OrchestratorError> {
        self.ensure_running()?;
        Ok(retrieve_snapshot(
            self.log_store.as_ref(),
            self.session.as_ref(),
            &self.registry,
            address,
            self.config.reconstruct_timeout,
        )
        .await?)
    }

    /// Lazy variant of [`retrieve_snapshot`](Self::retrieve_snapshot).
    pub async fn retrieve_snapshot_stream(
        &self,
        address: &DbAddress,
    ) -> Result<impl Stream<Item = Result<Snapshot, RetrieveError>> + Send + '_, OrchestratorError>
    {
        self.ensure_running()?;
        let jobs = matching_jobs(&self.registry, address).await?;
        Ok(materialize_all(
            self.log_store.as_ref(),
            self.session.as_ref(),
            jobs,
            self.config.reconstruct_timeout,
        ))
    }

    /// Number of background tasks still running.
    pub fn active_watchers(&self) -> usize {
        self.watchers.len()
    }

    /// Cancel every background task, then disconnect the log store.
    ///
    /// No registry write happens after this returns. Calling it again is a
    /// no-op.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.watchers.shutdown().await;
        self.log_store.disconnect().await?;
        info!(endpoint = %self.config.endpoint, "orchestrator stopped");
        Ok(())
    }
}
