//! Job registry and status reconciliation.

pub mod registry;
pub mod status;
pub mod watcher;

pub use registry::{INDEX_BY, JobRegistry, RegistryError};
pub use status::first_status;
pub use watcher::{
    ReconcileError, ReconcileOutcome, ReconcilePolicy, WatcherSet, reconcile_once,
};
