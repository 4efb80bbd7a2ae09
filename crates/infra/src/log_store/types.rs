//! Log entries, logs and their portable snapshot form.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha3::{Digest, Sha3_256};

use snapvault_core::EntryHash;

use super::r#trait::LogStoreError;

/// Lamport clock stamped on every entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportClock {
    /// Writer identity.
    pub id: String,
    pub time: u64,
}

/// One immutable entry of an append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub hash: EntryHash,
    /// Id of the log this entry belongs to (the database address).
    pub id: String,
    pub payload: JsonValue,
    /// Entries this one points back to.
    pub next: Vec<EntryHash>,
    pub clock: LamportClock,
}

impl LogEntry {
    pub fn new(
        log_id: impl Into<String>,
        payload: JsonValue,
        next: Vec<EntryHash>,
        clock: LamportClock,
    ) -> Self {
        let id = log_id.into();
        let hash = Self::content_hash(&id, &payload, &next, &clock);
        Self {
            hash,
            id,
            payload,
            next,
            clock,
        }
    }

    fn content_hash(
        id: &str,
        payload: &JsonValue,
        next: &[EntryHash],
        clock: &LamportClock,
    ) -> EntryHash {
        let mut hasher = Sha3_256::new();
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        hasher.update([0u8]);
        for n in next {
            hasher.update(n.as_str().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(clock.id.as_bytes());
        hasher.update(clock.time.to_be_bytes());

        // A hex digest is never empty.
        EntryHash::new(hex::encode(hasher.finalize()))
            .unwrap_or_else(|_| unreachable!("hex digest is non-empty"))
    }

    /// Recompute the hash and compare with the stored one.
    pub fn verify(&self) -> bool {
        Self::content_hash(&self.id, &self.payload, &self.next, &self.clock) == self.hash
    }

    fn sort_key(&self) -> (u64, &str, &str) {
        (self.clock.time, self.clock.id.as_str(), self.hash.as_str())
    }
}

/// Portable snapshot of a log: what gets serialized and stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub id: String,
    pub heads: Vec<EntryHash>,
    pub values: Vec<LogEntry>,
}

impl LogSnapshot {
    pub fn size(&self) -> usize {
        self.values.len()
    }
}

/// Bounds applied when turning a snapshot back into a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructOptions {
    /// Keep at most this many (newest) entries. `None` means no cap.
    pub length: Option<usize>,
    pub timeout: Duration,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            length: None,
            timeout: Duration::from_secs(1),
        }
    }
}

/// An in-memory log: entries ordered by Lamport clock, then writer, then hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    id: String,
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
        }
    }

    /// Build a log from a snapshot, verifying every entry.
    pub fn from_snapshot(
        snapshot: LogSnapshot,
        options: &ReconstructOptions,
    ) -> Result<Self, LogStoreError> {
        if snapshot.id.trim().is_empty() {
            return Err(LogStoreError::InvalidSnapshot("snapshot has no log id".into()));
        }

        let mut log = Log::new(snapshot.id);
        for entry in snapshot.values {
            log.insert(entry)?;
        }

        for head in &snapshot.heads {
            if !log.contains(head) {
                return Err(LogStoreError::InvalidSnapshot(format!(
                    "head {head} missing from snapshot values"
                )));
            }
        }

        if let Some(max) = options.length {
            let excess = log.entries.len().saturating_sub(max);
            log.entries.drain(..excess);
        }

        Ok(log)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn contains(&self, hash: &EntryHash) -> bool {
        self.entries.iter().any(|e| &e.hash == hash)
    }

    pub fn get(&self, hash: &EntryHash) -> Option<&LogEntry> {
        self.entries.iter().find(|e| &e.hash == hash)
    }

    /// Entries no other entry points back to.
    pub fn heads(&self) -> Vec<&LogEntry> {
        let referenced: HashSet<&EntryHash> =
            self.entries.iter().flat_map(|e| e.next.iter()).collect();
        self.entries
            .iter()
            .filter(|e| !referenced.contains(&e.hash))
            .collect()
    }

    /// Highest Lamport time seen in this log.
    pub fn max_time(&self) -> u64 {
        self.entries.iter().map(|e| e.clock.time).max().unwrap_or(0)
    }

    /// Insert a single verified entry. Returns `false` if it was already present.
    pub fn insert(&mut self, entry: LogEntry) -> Result<bool, LogStoreError> {
        if entry.id != self.id {
            return Err(LogStoreError::LogIdMismatch {
                expected: self.id.clone(),
                found: entry.id,
            });
        }
        if !entry.verify() {
            return Err(LogStoreError::Verification(entry.hash.to_string()));
        }
        if self.contains(&entry.hash) {
            return Ok(false);
        }

        let pos = self
            .entries
            .partition_point(|e| e.sort_key() < entry.sort_key());
        self.entries.insert(pos, entry);
        Ok(true)
    }

    /// Merge another log with the same id into this one. Returns how many
    /// entries were new.
    pub fn join(&mut self, other: &Log) -> Result<usize, LogStoreError> {
        if other.id != self.id {
            return Err(LogStoreError::LogIdMismatch {
                expected: self.id.clone(),
                found: other.id.clone(),
            });
        }

        let mut added = 0;
        for entry in &other.entries {
            if self.insert(entry.clone())? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn to_snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            id: self.id.clone(),
            heads: self.heads().into_iter().map(|e| e.hash.clone()).collect(),
            values: self.entries.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
