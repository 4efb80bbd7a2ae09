//! `snapvault-core`: domain building blocks for the snapshot job orchestrator.
//!
//! Pure types only: identifiers, job records and wallet addresses. No IO.

pub mod error;
pub mod id;
pub mod job;
pub mod wallet;

pub use error::CoreError;
pub use id::{Cid, DbAddress, EntryHash, JobId, SessionToken};
pub use job::{BackendJob, DealError, JobRecord, JobStatus};
pub use wallet::WalletAddress;
