//! In-memory event bus for tests/dev.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct BusState<M> {
    subscribers: Vec<mpsc::UnboundedSender<M>>,
    history: Vec<M>,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out
/// - Optional replay: a bus built with [`InMemoryEventBus::replaying`] hands
///   every new subscriber the full publish history before any live message,
///   so a listener attached after a producer started still sees the stream
///   from the beginning; [`InMemoryEventBus::clear_history`] starts a new
///   replay window
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    state: Mutex<BusState<M>>,
    replay: bool,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replaying() -> Self {
        Self {
            replay: true,
            ..Self::default()
        }
    }

    /// Forget the publish history. Subscribers attached afterwards replay
    /// only what is published from here on; live subscribers are unaffected.
    pub fn clear_history(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.history.clear();
        }
    }

    /// Number of subscribers that were still attached at the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                history: Vec::new(),
            }),
            replay: false,
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|tx| tx.send(message.clone()).is_ok());

        if self.replay {
            state.history.push(message);
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages.
        if let Ok(mut state) = self.state.lock() {
            for message in &state.history {
                let _ = tx.send(message.clone());
            }
            state.subscribers.push(tx);
        }

        Subscription::new(rx)
    }
}
