use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use snapvault_core::{BackendJob, Cid, JobId, SessionToken, WalletAddress};
use snapvault_events::Subscription;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("session rejected: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job watch closed before a status arrived: {0}")]
    WatchClosed(JobId),
}

impl BackendError {
    /// Errors worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// One balance line of the session's account info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub addr: Option<WalletAddress>,
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: String,
    #[serde(rename = "balancesList")]
    pub balances: Vec<BalanceInfo>,
}

/// Response of [`StorageSession::info`]. `info` is absent while the backend
/// has not finished setting up the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    pub info: Option<AccountInfo>,
}

impl InfoResponse {
    /// Balance line for `addr`, if the account lists it.
    pub fn balance_of(&self, addr: &str) -> Option<&BalanceInfo> {
        self.info.as_ref()?.balances.iter().find(|b| {
            b.addr
                .as_ref()
                .is_some_and(|wallet| wallet.addr == addr)
        })
    }
}

/// Entry point to the storage service.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open a new authenticated session against `endpoint`.
    async fn create_session(&self, endpoint: &Url)
    -> Result<Arc<dyn StorageSession>, BackendError>;
}

/// An authenticated storage session.
#[async_trait]
pub trait StorageSession: Send + Sync {
    fn token(&self) -> &SessionToken;

    /// Provision a named funding address.
    async fn new_address(&self, name: &str) -> Result<WalletAddress, BackendError>;

    async fn addresses(&self) -> Result<Vec<WalletAddress>, BackendError>;

    async fn info(&self) -> Result<InfoResponse, BackendError>;

    /// Stage bytes on the content-addressed transport.
    async fn stage(&self, bytes: Vec<u8>) -> Result<Cid, BackendError>;

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BackendError>;

    /// Ask the backend to archive `cid` with the default storage config.
    async fn push_storage_config(&self, cid: &Cid) -> Result<JobId, BackendError>;

    /// Stream status updates for `job_id`. The current status is delivered
    /// first. Dropping the subscription cancels the watch.
    async fn watch_jobs(&self, job_id: &JobId) -> Result<Subscription<BackendJob>, BackendError>;
}

#[async_trait]
impl<S> StorageBackend for Arc<S>
where
    S: StorageBackend + ?Sized,
{
    async fn create_session(
        &self,
        endpoint: &Url,
    ) -> Result<Arc<dyn StorageSession>, BackendError> {
        (**self).create_session(endpoint).await
    }
}
