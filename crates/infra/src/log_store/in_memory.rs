//! In-memory log store for tests/dev.
//!
//! Several [`InMemoryLogStore`]s (one per peer) share a [`ReplicationNetwork`].
//! Opening an address that other peers hold starts a background replication
//! pass that walks the remote log from its heads back to the tail, emitting a
//! `Progress` event per fetched entry and a final `Replicated` event. Every
//! `open`, including one on a database that is already open, starts a new
//! pass. The replication bus replays the current pass to late subscribers,
//! so a listener attached right after `open` sees all of it and nothing
//! from earlier passes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sha3::{Digest, Sha3_256};
use tracing::{debug, warn};

use snapvault_core::{DbAddress, EntryHash};
use snapvault_events::{EventBus, InMemoryEventBus, ReplicationEvent, Subscription};

use super::r#trait::{DocumentStore, LogDatabase, LogStore, LogStoreConnector, LogStoreError};
use super::types::{LamportClock, Log, LogEntry, LogSnapshot, ReconstructOptions};
use crate::transport::TransportOptions;

fn poisoned() -> LogStoreError {
    LogStoreError::Storage("lock poisoned".to_string())
}

/// Peers that can replicate from one another.
#[derive(Debug, Default)]
pub struct ReplicationNetwork {
    replicas: Mutex<HashMap<DbAddress, Vec<Weak<InMemoryLogDatabase>>>>,
}

impl ReplicationNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, db: &Arc<InMemoryLogDatabase>) {
        if let Ok(mut replicas) = self.replicas.lock() {
            replicas
                .entry(db.address.clone())
                .or_default()
                .push(Arc::downgrade(db));
        }
    }

    fn unregister(&self, db: &InMemoryLogDatabase) {
        if let Ok(mut replicas) = self.replicas.lock() {
            if let Some(peers) = replicas.get_mut(&db.address) {
                peers.retain(|w| w.upgrade().is_some_and(|p| !std::ptr::eq(Arc::as_ptr(&p), db)));
            }
        }
    }

    /// Union of every entry the other live replicas of `address` hold.
    fn remote_log(&self, address: &DbAddress, local: &InMemoryLogDatabase) -> Log {
        let peers: Vec<Arc<InMemoryLogDatabase>> = match self.replicas.lock() {
            Ok(replicas) => replicas
                .get(address)
                .map(|v| v.iter().filter_map(Weak::upgrade).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let mut remote = Log::new(address.as_str());
        for peer in peers.iter().filter(|p| !std::ptr::eq(Arc::as_ptr(p), local)) {
            if let Ok(oplog) = peer.oplog.read() {
                if let Err(e) = remote.join(&oplog) {
                    warn!(address = %address, error = %e, "skipping unreadable peer replica");
                }
            }
        }
        remote
    }
}

/// One peer's replica of a log database.
#[derive(Debug)]
pub struct InMemoryLogDatabase {
    address: DbAddress,
    peer_id: String,
    oplog: RwLock<Log>,
    index: RwLock<Vec<LogEntry>>,
    events: InMemoryEventBus<ReplicationEvent>,
    network: Arc<ReplicationNetwork>,
    dropped: AtomicBool,
}

impl InMemoryLogDatabase {
    fn new(address: DbAddress, peer_id: String, network: Arc<ReplicationNetwork>) -> Arc<Self> {
        let db = Arc::new(Self {
            oplog: RwLock::new(Log::new(address.as_str())),
            address,
            peer_id,
            index: RwLock::new(Vec::new()),
            events: InMemoryEventBus::replaying(),
            network: network.clone(),
            dropped: AtomicBool::new(false),
        });
        network.register(&db);
        db
    }

    fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), LogStoreError> {
        if self.is_dropped() {
            return Err(LogStoreError::Dropped(self.address.clone()));
        }
        Ok(())
    }

    fn holds(&self, hash: &EntryHash) -> bool {
        self.oplog.read().map(|l| l.contains(hash)).unwrap_or(false)
    }

    fn refresh_index(&self) -> Result<(), LogStoreError> {
        let values = self.oplog.read().map_err(|_| poisoned())?.values().to_vec();
        *self.index.write().map_err(|_| poisoned())? = values;
        Ok(())
    }

    /// Pull every entry other peers hold, newest first.
    async fn replicate(self: Arc<Self>) {
        let remote = self.network.remote_log(&self.address, &self);
        let mut queue: VecDeque<EntryHash> =
            remote.heads().into_iter().map(|e| e.hash.clone()).collect();
        let mut seen = HashSet::new();
        let mut fetched = 0usize;

        while let Some(hash) = queue.pop_front() {
            if self.is_dropped() {
                debug!(address = %self.address, "replica dropped mid-replication");
                return;
            }
            if !seen.insert(hash.clone()) || self.holds(&hash) {
                continue;
            }
            let Some(entry) = remote.get(&hash).cloned() else {
                continue;
            };

            let pending: Vec<EntryHash> = entry
                .next
                .iter()
                .filter(|n| !self.holds(n))
                .cloned()
                .collect();
            queue.extend(entry.next.iter().cloned());

            match self.oplog.write() {
                Ok(mut oplog) => {
                    if let Err(e) = oplog.insert(entry) {
                        warn!(address = %self.address, error = %e, "rejected replicated entry");
                        continue;
                    }
                }
                Err(_) => return,
            }
            fetched += 1;

            let _ = self.events.publish(ReplicationEvent::Progress {
                address: self.address.clone(),
                entry: hash,
                pending,
            });
            tokio::task::yield_now().await;
        }

        if fetched > 0 {
            debug!(address = %self.address, entries = fetched, "replication pass complete");
            let _ = self.events.publish(ReplicationEvent::Replicated {
                address: self.address.clone(),
                entries: fetched,
            });
        }
    }
}

#[async_trait]
impl LogDatabase for InMemoryLogDatabase {
    fn address(&self) -> &DbAddress {
        &self.address
    }

    fn replication_events(&self) -> Subscription<ReplicationEvent> {
        self.events.subscribe()
    }

    async fn append(&self, payload: JsonValue) -> Result<EntryHash, LogStoreError> {
        self.ensure_live()?;
        let hash = {
            let mut oplog = self.oplog.write().map_err(|_| poisoned())?;
            let next = oplog.heads().into_iter().map(|e| e.hash.clone()).collect();
            let clock = LamportClock {
                id: self.peer_id.clone(),
                time: oplog.max_time() + 1,
            };
            let entry = LogEntry::new(self.address.as_str(), payload, next, clock);
            let hash = entry.hash.clone();
            oplog.insert(entry)?;
            hash
        };
        self.refresh_index()?;
        Ok(hash)
    }

    async fn load(&self) -> Result<(), LogStoreError> {
        self.ensure_live()?;
        self.refresh_index()
    }

    async fn values(&self) -> Result<Vec<LogEntry>, LogStoreError> {
        Ok(self.index.read().map_err(|_| poisoned())?.clone())
    }

    async fn export_snapshot(&self) -> Result<LogSnapshot, LogStoreError> {
        self.ensure_live()?;
        Ok(self.oplog.read().map_err(|_| poisoned())?.to_snapshot())
    }

    async fn join(&self, log: &Log) -> Result<usize, LogStoreError> {
        self.ensure_live()?;
        let added = self.oplog.write().map_err(|_| poisoned())?.join(log)?;
        self.refresh_index()?;
        Ok(added)
    }

    async fn drop_local(&self) -> Result<(), LogStoreError> {
        self.dropped.store(true, Ordering::SeqCst);
        self.network.unregister(self);
        self.oplog.write().map_err(|_| poisoned())?.clear();
        self.index.write().map_err(|_| poisoned())?.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), LogStoreError> {
        self.network.unregister(self);
        Ok(())
    }
}

/// In-memory document store. Every `put` is appended to an operation log;
/// `load` rebuilds the index from it.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    name: String,
    index_by: String,
    ops: RwLock<Vec<JsonValue>>,
    index: RwLock<Vec<JsonValue>>,
}

impl InMemoryDocumentStore {
    pub fn new(name: impl Into<String>, index_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index_by: index_by.into(),
            ops: RwLock::new(Vec::new()),
            index: RwLock::new(Vec::new()),
        }
    }

    /// Number of `put` operations ever applied.
    pub fn write_count(&self) -> usize {
        self.ops.read().map(|ops| ops.len()).unwrap_or(0)
    }

    fn key_of(&self, doc: &JsonValue) -> Option<String> {
        doc.get(&self.index_by)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }

    fn upsert(&self, index: &mut Vec<JsonValue>, doc: JsonValue) {
        let key = self.key_of(&doc);
        match index.iter_mut().find(|d| self.key_of(d) == key) {
            Some(existing) => *existing = doc,
            None => index.push(doc),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn index_by(&self) -> &str {
        &self.index_by
    }

    async fn load(&self) -> Result<(), LogStoreError> {
        let ops = self.ops.read().map_err(|_| poisoned())?.clone();
        let mut index = Vec::with_capacity(ops.len());
        for doc in ops {
            self.upsert(&mut index, doc);
        }
        *self.index.write().map_err(|_| poisoned())? = index;
        Ok(())
    }

    async fn put(&self, document: JsonValue) -> Result<(), LogStoreError> {
        if self.key_of(&document).is_none() {
            return Err(LogStoreError::InvalidDocument(format!(
                "document has no string field '{}'",
                self.index_by
            )));
        }

        self.ops.write().map_err(|_| poisoned())?.push(document.clone());
        let mut index = self.index.write().map_err(|_| poisoned())?;
        self.upsert(&mut index, document);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<JsonValue>, LogStoreError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index
            .iter()
            .filter(|d| self.key_of(d).as_deref() == Some(key))
            .cloned()
            .collect())
    }

    async fn query(
        &self,
        predicate: &(dyn for<'a> Fn(&'a JsonValue) -> bool + Send + Sync),
    ) -> Result<Vec<JsonValue>, LogStoreError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index.iter().filter(|d| predicate(d)).cloned().collect())
    }
}

/// One peer's log store session.
#[derive(Debug)]
pub struct InMemoryLogStore {
    peer_id: String,
    network: Arc<ReplicationNetwork>,
    databases: Mutex<HashMap<DbAddress, Arc<InMemoryLogDatabase>>>,
    docstores: Mutex<HashMap<String, Arc<InMemoryDocumentStore>>>,
    transport: Option<TransportOptions>,
    disconnected: AtomicBool,
}

impl InMemoryLogStore {
    pub fn new(peer_id: impl Into<String>, network: Arc<ReplicationNetwork>) -> Self {
        Self {
            peer_id: peer_id.into(),
            network,
            databases: Mutex::new(HashMap::new()),
            docstores: Mutex::new(HashMap::new()),
            transport: None,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport(&self) -> Option<&TransportOptions> {
        self.transport.as_ref()
    }

    /// Concrete handle to a document store opened through [`LogStore::docs`].
    pub fn document_store(&self, name: &str) -> Option<Arc<InMemoryDocumentStore>> {
        self.docstores.lock().ok()?.get(name).cloned()
    }

    fn ensure_connected(&self) -> Result<(), LogStoreError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(LogStoreError::Disconnected);
        }
        Ok(())
    }

    fn address_for(&self, name: &str) -> Result<DbAddress, LogStoreError> {
        let mut hasher = Sha3_256::new();
        hasher.update(self.peer_id.as_bytes());
        hasher.update(b"/");
        hasher.update(name.as_bytes());
        let digest = hex::encode(hasher.finalize());

        DbAddress::new(format!("/orbitdb/zdpu{}/{}", &digest[..16], name))
            .map_err(|e| LogStoreError::Storage(e.to_string()))
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn LogDatabase>, LogStoreError> {
        if name.trim().is_empty() {
            return Err(LogStoreError::Storage("database name is empty".to_string()));
        }
        let address = self.address_for(name)?;
        self.open(&address).await
    }

    async fn open(&self, address: &DbAddress) -> Result<Arc<dyn LogDatabase>, LogStoreError> {
        self.ensure_connected()?;

        let db = {
            let mut databases = self.databases.lock().map_err(|_| poisoned())?;
            match databases.get(address) {
                Some(db) if !db.is_dropped() => db.clone(),
                _ => {
                    let db = InMemoryLogDatabase::new(
                        address.clone(),
                        self.peer_id.clone(),
                        self.network.clone(),
                    );
                    databases.insert(address.clone(), db.clone());
                    db
                }
            }
        };

        // Each open starts a new replication pass; listeners attached from
        // here on must not see the events of an earlier one.
        db.events.clear_history();
        tokio::spawn(db.clone().replicate());
        Ok(db)
    }

    async fn docs(
        &self,
        name: &str,
        index_by: &str,
    ) -> Result<Arc<dyn DocumentStore>, LogStoreError> {
        self.ensure_connected()?;
        let mut docstores = self.docstores.lock().map_err(|_| poisoned())?;
        let store = docstores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryDocumentStore::new(name, index_by)))
            .clone();

        if store.index_by() != index_by {
            return Err(LogStoreError::InvalidDocument(format!(
                "document store '{name}' is indexed by '{}'",
                store.index_by()
            )));
        }
        Ok(store)
    }

    async fn materialize(
        &self,
        snapshot: LogSnapshot,
        options: ReconstructOptions,
    ) -> Result<Log, LogStoreError> {
        self.ensure_connected()?;
        Log::from_snapshot(snapshot, &options)
    }

    async fn disconnect(&self) -> Result<(), LogStoreError> {
        self.disconnected.store(true, Ordering::SeqCst);
        let databases: Vec<_> = self
            .databases
            .lock()
            .map_err(|_| poisoned())?
            .drain()
            .map(|(_, db)| db)
            .collect();
        for db in databases {
            db.close().await?;
        }
        Ok(())
    }
}

/// Hands out [`InMemoryLogStore`] sessions on a shared network and records
/// the transport options each connection was made with.
#[derive(Debug)]
pub struct InMemoryLogConnector {
    peer_id: String,
    network: Arc<ReplicationNetwork>,
    connections: Mutex<Vec<TransportOptions>>,
    stores: Mutex<Vec<Arc<InMemoryLogStore>>>,
}

impl InMemoryLogConnector {
    pub fn new(peer_id: impl Into<String>, network: Arc<ReplicationNetwork>) -> Self {
        Self {
            peer_id: peer_id.into(),
            network,
            connections: Mutex::new(Vec::new()),
            stores: Mutex::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> Vec<TransportOptions> {
        self.connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Most recent store handed out, for inspecting its document stores.
    pub fn last_store(&self) -> Option<Arc<InMemoryLogStore>> {
        self.stores.lock().ok()?.last().cloned()
    }
}

#[async_trait]
impl LogStoreConnector for InMemoryLogConnector {
    async fn connect(
        &self,
        transport: &TransportOptions,
    ) -> Result<Arc<dyn LogStore>, LogStoreError> {
        let store = Arc::new(
            InMemoryLogStore::new(self.peer_id.clone(), self.network.clone())
                .with_transport(transport.clone()),
        );
        self.connections
            .lock()
            .map_err(|_| poisoned())?
            .push(transport.clone());
        self.stores.lock().map_err(|_| poisoned())?.push(store.clone());
        Ok(store)
    }
}
