//! Replication convergence detection.
//!
//! A database is considered converged once replication has delivered its
//! tail entry (a progress event with nothing pending) **and** a batch-complete
//! event has fired after that. A batch-complete event seen before the tail
//! does not count.
//!
//! [`ConvergenceDetector`] is the pure state machine; [`wait_for_convergence`]
//! drives it from a live subscription.

use std::time::Duration;

use tracing::debug;

use crate::bus::Subscription;
use crate::replication::ReplicationEvent;

/// Detector state for one capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceState {
    /// Still replicating. `tail_observed` flips once the zero-pending entry
    /// has been seen and never flips back within the attempt.
    AwaitingTail { tail_observed: bool },
    /// Terminal.
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConvergenceError {
    #[error("replication stream closed before convergence")]
    StreamClosed,
    #[error("no convergence within {0:?}")]
    DeadlineElapsed(Duration),
}

#[derive(Debug, Clone)]
pub struct ConvergenceDetector {
    state: ConvergenceState,
}

impl ConvergenceDetector {
    pub fn new() -> Self {
        Self {
            state: ConvergenceState::AwaitingTail {
                tail_observed: false,
            },
        }
    }

    pub fn state(&self) -> ConvergenceState {
        self.state
    }

    pub fn is_converged(&self) -> bool {
        self.state == ConvergenceState::Converged
    }

    /// Feed one event. Returns `true` exactly once per attempt: on the
    /// transition into [`ConvergenceState::Converged`].
    pub fn observe(&mut self, event: &ReplicationEvent) -> bool {
        match (self.state, event) {
            (ConvergenceState::Converged, _) => false,
            (ConvergenceState::AwaitingTail { .. }, ReplicationEvent::Progress { .. })
                if event.is_tail() =>
            {
                self.state = ConvergenceState::AwaitingTail {
                    tail_observed: true,
                };
                false
            }
            (ConvergenceState::AwaitingTail { tail_observed: true }, ReplicationEvent::Replicated { .. }) => {
                self.state = ConvergenceState::Converged;
                true
            }
            _ => false,
        }
    }
}

impl Default for ConvergenceDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume `events` until the database converges.
///
/// The subscription is dropped on return, which detaches the listener, so
/// later replication events cannot re-trigger anything. With `deadline` set
/// to `None` this waits indefinitely.
pub async fn wait_for_convergence(
    mut events: Subscription<ReplicationEvent>,
    deadline: Option<Duration>,
) -> Result<(), ConvergenceError> {
    let mut detector = ConvergenceDetector::new();

    let drive = async {
        while let Some(event) = events.recv().await {
            debug!(address = %event.address(), ?event, "replication event");
            if detector.observe(&event) {
                return Ok(());
            }
        }
        Err(ConvergenceError::StreamClosed)
    };

    match deadline {
        Some(limit) => tokio::time::timeout(limit, drive)
            .await
            .map_err(|_| ConvergenceError::DeadlineElapsed(limit))?,
        None => drive.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBus, InMemoryEventBus};
    use proptest::prelude::*;
    use snapvault_core::{DbAddress, EntryHash};

    fn address() -> DbAddress {
        DbAddress::new("/orbitdb/zdpuA/powergate-test").unwrap()
    }

    fn progress(n: usize, pending: usize) -> ReplicationEvent {
        ReplicationEvent::Progress {
            address: address(),
            entry: EntryHash::new(format!("entry-{n}")).unwrap(),
            pending: (0..pending)
                .map(|i| EntryHash::new(format!("pending-{n}-{i}")).unwrap())
                .collect(),
        }
    }

    fn replicated() -> ReplicationEvent {
        ReplicationEvent::Replicated {
            address: address(),
            entries: 1,
        }
    }

    #[test]
    fn converges_after_tail_then_complete() {
        let mut detector = ConvergenceDetector::new();

        assert!(!detector.observe(&progress(3, 1)));
        assert!(!detector.observe(&progress(2, 1)));
        assert!(!detector.observe(&progress(1, 0)));
        assert_eq!(
            detector.state(),
            ConvergenceState::AwaitingTail {
                tail_observed: true
            }
        );
        assert!(detector.observe(&replicated()));
        assert!(detector.is_converged());
    }

    #[test]
    fn complete_before_tail_does_not_converge() {
        let mut detector = ConvergenceDetector::new();

        assert!(!detector.observe(&replicated()));
        assert!(!detector.observe(&progress(1, 0)));
        assert!(!detector.is_converged());
    }

    #[test]
    fn converges_only_once() {
        let mut detector = ConvergenceDetector::new();
        detector.observe(&progress(1, 0));

        assert!(detector.observe(&replicated()));
        assert!(!detector.observe(&progress(2, 0)));
        assert!(!detector.observe(&replicated()));
    }

    #[test]
    fn pending_entries_after_tail_do_not_reset() {
        let mut detector = ConvergenceDetector::new();
        detector.observe(&progress(1, 0));
        detector.observe(&progress(2, 3));

        assert!(detector.observe(&replicated()));
    }

    #[tokio::test]
    async fn waits_on_live_subscription() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();

        bus.publish(replicated()).unwrap();
        bus.publish(progress(2, 1)).unwrap();
        bus.publish(progress(1, 0)).unwrap();
        bus.publish(replicated()).unwrap();

        wait_for_convergence(sub, None).await.unwrap();

        // Listener detached once converged.
        bus.publish(replicated()).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_stream_is_an_error() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        bus.publish(replicated()).unwrap();
        drop(bus);

        let err = wait_for_convergence(sub, None).await.unwrap_err();
        assert_eq!(err, ConvergenceError::StreamClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_wait() {
        let bus: InMemoryEventBus<ReplicationEvent> = InMemoryEventBus::new();
        let sub = bus.subscribe();

        let err = wait_for_convergence(sub, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, ConvergenceError::DeadlineElapsed(Duration::from_secs(5)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Progress { pending: usize },
        Replicated,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..3).prop_map(|pending| Step::Progress { pending }),
            Just(Step::Replicated),
        ]
    }

    proptest! {
        #[test]
        fn fires_exactly_at_first_complete_after_tail(steps in prop::collection::vec(step(), 0..40)) {
            let mut detector = ConvergenceDetector::new();
            let mut tail_seen = false;
            let mut expected_fire: Option<usize> = None;

            for (i, s) in steps.iter().enumerate() {
                match s {
                    Step::Progress { pending } if *pending == 0 => tail_seen = true,
                    Step::Replicated if tail_seen && expected_fire.is_none() => expected_fire = Some(i),
                    _ => {}
                }
            }

            let mut fired = Vec::new();
            for (i, s) in steps.iter().enumerate() {
                let event = match s {
                    Step::Progress { pending } => progress(i, *pending),
                    Step::Replicated => replicated(),
                };
                if detector.observe(&event) {
                    fired.push(i);
                }
            }

            prop_assert_eq!(fired, expected_fire.into_iter().collect::<Vec<_>>());
            prop_assert_eq!(detector.is_converged(), expected_fire.is_some());
        }
    }
}
