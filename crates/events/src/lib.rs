//! Replication notifications and the machinery to consume them.

pub mod bus;
pub mod convergence;
pub mod in_memory_bus;
pub mod replication;

pub use bus::{EventBus, Subscription};
pub use convergence::{
    ConvergenceDetector, ConvergenceError, ConvergenceState, wait_for_convergence,
};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use replication::ReplicationEvent;
