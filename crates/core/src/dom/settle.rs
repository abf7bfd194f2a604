//! Settle detection: waiting for the document to quiesce.
//!
//! A [`SettleObserver`] is an explicit subscription to the document's
//! mutation stream, created when a command starts acting and torn down
//! when the wait resolves - never left running globally. It resolves as
//! soon as no mutation has been seen for the quiet period, or at the hard
//! deadline regardless.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{Document, Mutation};

/// Result of one settle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleOutcome {
    /// Total time from observation start until resolution.
    pub elapsed_ms: u64,
    /// True when the hard deadline cut the wait short.
    pub timed_out: bool,
}

/// One-shot mutation observer scoped to a single settle wait.
pub struct SettleObserver {
    mutations: broadcast::Receiver<Mutation>,
}

impl SettleObserver {
    /// Starts observing; mutations before this call are not counted.
    pub fn observe(document: &Document) -> Self {
        SettleObserver {
            mutations: document.subscribe_mutations(),
        }
    }

    /// Resolves once the document has been quiet for `quiet_period`, or
    /// after `max_wait` regardless.
    pub async fn settle(mut self, max_wait: Duration, quiet_period: Duration) -> SettleOutcome {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut last_activity = started;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return SettleOutcome {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                };
            }
            let quiet_at = last_activity + quiet_period;
            if now >= quiet_at {
                return SettleOutcome {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                };
            }

            let wake = quiet_at.min(deadline);
            tokio::select! {
                received = self.mutations.recv() => match received {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        last_activity = Instant::now();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Document dropped; nothing further can mutate.
                        return SettleOutcome {
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            timed_out: false,
                        };
                    }
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
