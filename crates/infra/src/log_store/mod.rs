//! Replicated log store boundary.
//!
//! The log store is an external collaborator. This module defines the surface
//! the orchestrator drives, plus an in-memory replication network for
//! tests/dev.

pub mod in_memory;
pub mod r#trait;
pub mod types;

pub use in_memory::{InMemoryLogConnector, InMemoryLogStore, ReplicationNetwork};
pub use r#trait::{DocumentStore, LogDatabase, LogStore, LogStoreConnector, LogStoreError};
pub use types::{LamportClock, Log, LogEntry, LogSnapshot, ReconstructOptions};
