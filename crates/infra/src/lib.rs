//! Infrastructure layer: collaborator boundaries, in-memory collaborators,
//! job registry, snapshot round trip and the orchestrator that ties them
//! together.

pub mod backend;
pub mod config;
pub mod jobs;
pub mod log_store;
pub mod orchestrator;
pub mod poll;
pub mod provisioning;
pub mod snapshot;
pub mod transport;


pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use snapshot::Snapshot;
