//! Scriptable in-memory storage backend for tests/dev.
//!
//! Cloning an [`InMemoryBackend`] shares its state, so a test can hand one
//! clone to the orchestrator and keep another to drive job transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use sha3::{Digest, Sha3_256};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use snapvault_core::{BackendJob, Cid, DealError, JobId, JobStatus, SessionToken, WalletAddress};
use snapvault_events::Subscription;

use super::r#trait::{
    AccountInfo, BackendError, BalanceInfo, InfoResponse, StorageBackend, StorageSession,
};

/// Shape of the account info the backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoMode {
    #[default]
    Normal,
    /// `info` is absent from the response.
    MissingInfo,
    /// Account info lists no balances.
    WithoutAddress,
}

#[derive(Debug, Clone)]
struct Settings {
    initial_status: JobStatus,
    fund_after_polls: u32,
    fund_amount: u64,
    info_mode: InfoMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_status: JobStatus::Executing,
            fund_after_polls: 0,
            fund_amount: 4_000_000,
            info_mode: InfoMode::Normal,
        }
    }
}

#[derive(Debug, Default)]
struct BackendState {
    unreachable: AtomicBool,
    failing_info_calls: AtomicU32,
    settings: RwLock<Settings>,
    blobs: RwLock<HashMap<Cid, Vec<u8>>>,
    jobs: RwLock<HashMap<JobId, BackendJob>>,
    watchers: Mutex<HashMap<JobId, Vec<mpsc::UnboundedSender<BackendJob>>>>,
}

impl BackendState {
    fn ensure_reachable(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("backend unreachable".to_string()));
        }
        Ok(())
    }

    fn settings(&self) -> Settings {
        self.settings.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn update_job(
        &self,
        job_id: &JobId,
        apply: impl FnOnce(&mut BackendJob),
    ) -> Result<(), BackendError> {
        let updated = {
            let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
            apply(job);
            job.clone()
        };

        debug!(job_id = %job_id, status = %updated.status, "job status changed");
        let mut watchers = self.watchers.lock().map_err(|_| poisoned())?;
        if let Some(subscribers) = watchers.get_mut(job_id) {
            subscribers.retain(|tx| tx.send(updated.clone()).is_ok());
        }
        Ok(())
    }
}

fn poisoned() -> BackendError {
    BackendError::Unavailable("backend state lock poisoned".to_string())
}

fn digest_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status newly pushed jobs start in. Defaults to `EXECUTING`.
    pub fn with_initial_status(self, status: JobStatus) -> Self {
        if let Ok(mut s) = self.state.settings.write() {
            s.initial_status = status;
        }
        self
    }

    /// Report zero balance for the first `polls` info calls of each session,
    /// then `amount`.
    pub fn with_funding_after(self, polls: u32, amount: u64) -> Self {
        if let Ok(mut s) = self.state.settings.write() {
            s.fund_after_polls = polls;
            s.fund_amount = amount;
        }
        self
    }

    pub fn with_info_mode(self, mode: InfoMode) -> Self {
        if let Ok(mut s) = self.state.settings.write() {
            s.info_mode = mode;
        }
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make the next `count` info calls fail with a transient error.
    pub fn fail_next_info_calls(&self, count: u32) {
        self.state.failing_info_calls.store(count, Ordering::SeqCst);
    }

    /// Move a job to `status` and notify its watchers.
    pub fn set_job_status(&self, job_id: &JobId, status: JobStatus) -> Result<(), BackendError> {
        self.state.update_job(job_id, |job| job.status = status)
    }

    /// Fail a job with a cause and per-deal errors.
    pub fn fail_job(
        &self,
        job_id: &JobId,
        cause: impl Into<String>,
        deal_errors: Vec<DealError>,
    ) -> Result<(), BackendError> {
        let cause = cause.into();
        self.state.update_job(job_id, |job| {
            job.status = JobStatus::Failed;
            job.err_cause = cause;
            job.deal_errors = deal_errors;
        })
    }

    pub fn job(&self, job_id: &JobId) -> Option<BackendJob> {
        self.state.jobs.read().ok()?.get(job_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn blob_count(&self) -> usize {
        self.state.blobs.read().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn create_session(
        &self,
        endpoint: &Url,
    ) -> Result<Arc<dyn StorageSession>, BackendError> {
        self.state.ensure_reachable()?;
        if endpoint.host_str().is_none() {
            return Err(BackendError::InvalidRequest(format!(
                "endpoint has no host: {endpoint}"
            )));
        }

        let token = SessionToken::new(format!("ffs-{}", Uuid::now_v7()))
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        debug!(endpoint = %endpoint, "storage session created");

        Ok(Arc::new(InMemorySession {
            token,
            state: self.state.clone(),
            addresses: RwLock::new(Vec::new()),
            info_polls: AtomicU32::new(0),
        }))
    }
}

#[derive(Debug)]
struct InMemorySession {
    token: SessionToken,
    state: Arc<BackendState>,
    addresses: RwLock<Vec<WalletAddress>>,
    info_polls: AtomicU32,
}

impl InMemorySession {
    fn funded_addresses(&self, funded: bool, amount: u64) -> Result<Vec<WalletAddress>, BackendError> {
        let balance = if funded { amount } else { 0 };
        let addresses = self.addresses.read().map_err(|_| poisoned())?;
        Ok(addresses
            .iter()
            .cloned()
            .map(|a| a.with_balance(balance))
            .collect())
    }
}

#[async_trait]
impl StorageSession for InMemorySession {
    fn token(&self) -> &SessionToken {
        &self.token
    }

    async fn new_address(&self, name: &str) -> Result<WalletAddress, BackendError> {
        self.state.ensure_reachable()?;
        if name.trim().is_empty() {
            return Err(BackendError::InvalidRequest("address name is empty".to_string()));
        }

        let digest = digest_hex(&[self.token.as_str().as_bytes(), name.as_bytes()]);
        let address = WalletAddress {
            addr: format!("t3{}", &digest[..40]),
            name: name.to_string(),
            kind: "bls".to_string(),
            balance: 0,
        };
        self.addresses
            .write()
            .map_err(|_| poisoned())?
            .push(address.clone());
        Ok(address)
    }

    async fn addresses(&self) -> Result<Vec<WalletAddress>, BackendError> {
        self.state.ensure_reachable()?;
        let settings = self.state.settings();
        let funded = self.info_polls.load(Ordering::SeqCst) > settings.fund_after_polls;
        self.funded_addresses(funded, settings.fund_amount)
    }

    async fn info(&self) -> Result<InfoResponse, BackendError> {
        self.state.ensure_reachable()?;
        let failing = &self.state.failing_info_calls;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::Unavailable("info temporarily unavailable".to_string()));
        }

        let settings = self.state.settings();
        let previous_polls = self.info_polls.fetch_add(1, Ordering::SeqCst);
        let funded = previous_polls >= settings.fund_after_polls;

        let balances = match settings.info_mode {
            InfoMode::MissingInfo => return Ok(InfoResponse { info: None }),
            InfoMode::WithoutAddress => Vec::new(),
            InfoMode::Normal => self
                .funded_addresses(funded, settings.fund_amount)?
                .into_iter()
                .map(|a| BalanceInfo {
                    balance: a.balance,
                    addr: Some(a),
                })
                .collect(),
        };

        Ok(InfoResponse {
            info: Some(AccountInfo {
                id: self.token.as_str().to_string(),
                balances,
            }),
        })
    }

    async fn stage(&self, bytes: Vec<u8>) -> Result<Cid, BackendError> {
        self.state.ensure_reachable()?;
        let cid = Cid::new(format!("bafk{}", digest_hex(&[&bytes])))
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        self.state
            .blobs
            .write()
            .map_err(|_| poisoned())?
            .insert(cid.clone(), bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BackendError> {
        self.state.ensure_reachable()?;
        self.state
            .blobs
            .read()
            .map_err(|_| poisoned())?
            .get(cid)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("cid {cid}")))
    }

    async fn push_storage_config(&self, cid: &Cid) -> Result<JobId, BackendError> {
        self.state.ensure_reachable()?;
        if !self.state.blobs.read().map_err(|_| poisoned())?.contains_key(cid) {
            return Err(BackendError::NotFound(format!("cid {cid} is not staged")));
        }

        let id = JobId::new(Uuid::now_v7().to_string())
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        let job = BackendJob {
            id: id.clone(),
            cid: cid.clone(),
            status: self.state.settings().initial_status,
            err_cause: String::new(),
            deal_errors: Vec::new(),
        };
        self.state
            .jobs
            .write()
            .map_err(|_| poisoned())?
            .insert(id.clone(), job);
        debug!(job_id = %id, cid = %cid, "storage config pushed");
        Ok(id)
    }

    async fn watch_jobs(&self, job_id: &JobId) -> Result<Subscription<BackendJob>, BackendError> {
        self.state.ensure_reachable()?;
        let current = self
            .state
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .get(job_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(current);
        self.state
            .watchers
            .lock()
            .map_err(|_| poisoned())?
            .entry(job_id.clone())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
