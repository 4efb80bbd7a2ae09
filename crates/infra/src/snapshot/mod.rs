//! Snapshot round trip: capture a converged database into the storage
//! backend, and turn stored snapshots back into logs.

pub mod capture;
pub mod retrieve;

pub use capture::{CaptureOptions, SubmitError, store_snapshot};
pub use retrieve::{
    RETRIEVE_CONCURRENCY, RetrieveError, Snapshot, matching_jobs, materialize_all,
    retrieve_snapshot,
};
