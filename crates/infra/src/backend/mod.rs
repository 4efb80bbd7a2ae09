//! Storage backend boundary.
//!
//! The backend owns sessions, wallet addresses, blob staging and archival
//! jobs. The orchestrator drives it through [`StorageBackend`] and
//! [`StorageSession`]; [`in_memory`] provides a scriptable implementation.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::{InMemoryBackend, InfoMode};
pub use r#trait::{
    AccountInfo, BackendError, BalanceInfo, InfoResponse, StorageBackend, StorageSession,
};
