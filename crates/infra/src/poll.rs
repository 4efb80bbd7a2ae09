//! Fixed-interval polling with an optional overall deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};

/// How often to poll and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Give up after this long. `None` polls forever.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: None,
        }
    }
}

impl PollPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError<E> {
    #[error("{0}")]
    Failed(E),

    #[error("condition not met within {0:?}")]
    DeadlineElapsed(Duration),
}

/// Run `step` on every tick until it yields a value or fails.
///
/// The first tick fires immediately. `Ok(None)` means "not yet".
pub async fn poll_until<T, E, F, Fut>(policy: PollPolicy, mut step: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if let Some(limit) = policy.deadline {
            if started.elapsed() > limit {
                return Err(PollError::DeadlineElapsed(limit));
            }
        }

        if let Some(value) = step().await.map_err(PollError::Failed)? {
            return Ok(value);
        }
    }
}
