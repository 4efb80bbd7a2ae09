use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use snapvault_core::{DbAddress, EntryHash};
use snapvault_events::{ReplicationEvent, Subscription};

use super::types::{Log, LogEntry, LogSnapshot, ReconstructOptions};
use crate::transport::TransportOptions;

/// Log store operation error.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("database not found: {0}")]
    NotFound(DbAddress),

    #[error("database was dropped: {0}")]
    Dropped(DbAddress),

    #[error("log id mismatch: expected {expected}, found {found}")]
    LogIdMismatch { expected: String, found: String },

    #[error("entry failed verification: {0}")]
    Verification(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("log reconstruction timed out after {0:?}")]
    Timeout(Duration),

    #[error("log store is disconnected")]
    Disconnected,

    #[error("storage error: {0}")]
    Storage(String),
}

/// The replicated, append-only log store.
///
/// Everything here is owned by an external system; the orchestrator only
/// drives it. All methods may suspend on network or disk IO.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Identity of the local peer (stamped on entries it writes).
    fn peer_id(&self) -> &str;

    /// Create (or reopen) a local event log by name.
    async fn create(&self, name: &str) -> Result<Arc<dyn LogDatabase>, LogStoreError>;

    /// Open a database by address, replicating from peers that hold it.
    async fn open(&self, address: &DbAddress) -> Result<Arc<dyn LogDatabase>, LogStoreError>;

    /// Open a document store named `name`, keyed by the document field `index_by`.
    async fn docs(
        &self,
        name: &str,
        index_by: &str,
    ) -> Result<Arc<dyn DocumentStore>, LogStoreError>;

    /// Turn a portable snapshot back into a log object.
    async fn materialize(
        &self,
        snapshot: LogSnapshot,
        options: ReconstructOptions,
    ) -> Result<Log, LogStoreError>;

    /// Close every open database and release the session.
    async fn disconnect(&self) -> Result<(), LogStoreError>;
}

/// One open log database.
#[async_trait]
pub trait LogDatabase: Send + Sync {
    fn address(&self) -> &DbAddress;

    /// Subscribe to replication notifications. Dropping the subscription
    /// detaches the listener.
    fn replication_events(&self) -> Subscription<ReplicationEvent>;

    async fn append(&self, payload: JsonValue) -> Result<EntryHash, LogStoreError>;

    /// Rebuild the materialized view from everything held locally.
    async fn load(&self) -> Result<(), LogStoreError>;

    /// Materialized entries in log order, as of the last load/append/join.
    async fn values(&self) -> Result<Vec<LogEntry>, LogStoreError>;

    async fn export_snapshot(&self) -> Result<LogSnapshot, LogStoreError>;

    /// Merge a log into this database and refresh the materialized view.
    async fn join(&self, log: &Log) -> Result<usize, LogStoreError>;

    /// Discard the local replica.
    async fn drop_local(&self) -> Result<(), LogStoreError>;

    async fn close(&self) -> Result<(), LogStoreError>;
}

/// A document store: JSON documents keyed by one of their fields.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    fn index_by(&self) -> &str;

    async fn load(&self) -> Result<(), LogStoreError>;

    /// Upsert by the index field.
    async fn put(&self, document: JsonValue) -> Result<(), LogStoreError>;

    /// Documents whose index field equals `key` (zero or one).
    async fn get(&self, key: &str) -> Result<Vec<JsonValue>, LogStoreError>;

    async fn query(
        &self,
        predicate: &(dyn for<'a> Fn(&'a JsonValue) -> bool + Send + Sync),
    ) -> Result<Vec<JsonValue>, LogStoreError>;
}

/// Builds a log store session on top of a shared transport.
#[async_trait]
pub trait LogStoreConnector: Send + Sync {
    async fn connect(&self, transport: &TransportOptions)
    -> Result<Arc<dyn LogStore>, LogStoreError>;
}

#[async_trait]
impl<S> LogStore for Arc<S>
where
    S: LogStore + ?Sized,
{
    fn peer_id(&self) -> &str {
        (**self).peer_id()
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn LogDatabase>, LogStoreError> {
        (**self).create(name).await
    }

    async fn open(&self, address: &DbAddress) -> Result<Arc<dyn LogDatabase>, LogStoreError> {
        (**self).open(address).await
    }

    async fn docs(
        &self,
        name: &str,
        index_by: &str,
    ) -> Result<Arc<dyn DocumentStore>, LogStoreError> {
        (**self).docs(name, index_by).await
    }

    async fn materialize(
        &self,
        snapshot: LogSnapshot,
        options: ReconstructOptions,
    ) -> Result<Log, LogStoreError> {
        (**self).materialize(snapshot, options).await
    }

    async fn disconnect(&self) -> Result<(), LogStoreError> {
        (**self).disconnect().await
    }
}
