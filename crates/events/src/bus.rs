//! Event publishing/subscription abstraction (mechanics only).
//!
//! The log store announces replication progress through a bus like this one;
//! the convergence detector is just another subscriber.
//!
//! ## Delivery
//!
//! - **Broadcast**: every live subscription gets its own copy of each message
//! - **Ordered per publisher**: a subscription sees one publisher's messages in
//!   publish order
//! - **Detach by drop**: dropping a [`Subscription`] unregisters it; the bus
//!   prunes closed subscribers on the next publish

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to an event stream.
///
/// ```ignore
/// let mut sub = db.replication_events();
/// while let Some(event) = sub.recv().await {
///     if detector.observe(&event) {
///         break;
///     }
/// }
/// // `sub` dropped here: listener detached
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// `publish()` can fail (e.g. poisoned internal state, broken transport);
/// failures are surfaced to the publisher. Implementations must be safe to
/// share across tasks.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
