//! Notifications a log database emits while pulling entries from peers.

use serde::{Deserialize, Serialize};

use snapvault_core::{DbAddress, EntryHash};

/// Replication notification emitted by a log database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationEvent {
    /// One entry was fetched. `pending` lists the entries it links to that
    /// are not yet held locally; empty means this entry is the tail.
    Progress {
        address: DbAddress,
        entry: EntryHash,
        pending: Vec<EntryHash>,
    },
    /// A batch of incoming entries has been fully processed.
    Replicated { address: DbAddress, entries: usize },
}

impl ReplicationEvent {
    pub fn address(&self) -> &DbAddress {
        match self {
            ReplicationEvent::Progress { address, .. } => address,
            ReplicationEvent::Replicated { address, .. } => address,
        }
    }

    /// True for a progress event reporting nothing left to fetch.
    pub fn is_tail(&self) -> bool {
        matches!(self, ReplicationEvent::Progress { pending, .. } if pending.is_empty())
    }
}
