//! The barrier driver.

use fanin_store::{Arrival, BarrierStore, Combine, Contribution, StoreError};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::BarrierError;
use crate::evaluate::{evaluate, Evaluation};

/// What happens to a run's state once it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Retention {
    /// Clear the run. A later delivery for the same run id starts a new run.
    #[default]
    Delete,
    /// Keep the completed run. Further deliveries to it are rejected.
    Retain,
}

/// Result of offering one contribution to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Recorded; the run still needs `width - arrived` more.
    Waiting { arrived: i64, width: i64 },
    /// Already recorded under the same key. Nothing changed.
    Duplicate { arrived: i64, width: i64 },
    /// This contribution closed the run. Forward `merged` downstream.
    Complete { merged: Value, width: i64 },
    /// A redelivery of a contribution to a run that is still full. `merged`
    /// is the same event the completion produced; forward it again.
    Replayed { merged: Value, width: i64 },
    /// Belongs to a run that already completed and was cleared.
    Retired { width: i64 },
}

impl Outcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete { .. })
    }
}

/// Fan-in barrier of fixed width over an injected store.
///
/// Holds no run state of its own. Completion is decided by the store's
/// sequence assignment: the one caller whose append is accepted with
/// `sequence == width` completes the run, so the merged payload is produced
/// exactly once per run however appends interleave.
pub struct Barrier<S, C> {
    store: S,
    combine: C,
    width: i64,
    retention: Retention,
}

impl<S, C> Barrier<S, C>
where
    S: BarrierStore,
    C: Combine,
{
    pub fn new(store: S, combine: C, width: i64) -> Result<Self, BarrierError> {
        if width < 1 {
            return Err(BarrierError::InvalidWidth(width));
        }
        Ok(Self {
            store,
            combine,
            width,
            retention: Retention::default(),
        })
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record `contribution` in `run_id` and complete the run if it was the
    /// last one expected.
    pub async fn offer(
        &self,
        run_id: &str,
        contribution: Contribution,
    ) -> Result<Outcome, BarrierError> {
        let width = self.width;

        let arrival = match self.store.append(run_id, width, contribution).await {
            Ok(arrival) => arrival,
            Err(StoreError::RunClosed { run_id, width }) => {
                warn!(run_id = %run_id, width, "Contribution rejected, run already complete");
                return Err(BarrierError::RunClosed { run_id, width });
            }
            Err(e) => return Err(e.into()),
        };

        let sequence = match arrival {
            Arrival::Duplicate { arrived } if arrived >= width => {
                return self.replay(run_id).await;
            }
            Arrival::Duplicate { arrived } => {
                info!(run_id, arrived, width, "Duplicate contribution, ignoring");
                return Ok(Outcome::Duplicate { arrived, width });
            }
            Arrival::Retired => {
                info!(run_id, width, "Contribution of a cleared run, ignoring");
                return Ok(Outcome::Retired { width });
            }
            Arrival::Accepted { sequence } => sequence,
        };

        if sequence < width {
            info!(run_id, sequence, width, "Waiting for more contributions");
            return Ok(Outcome::Waiting {
                arrived: sequence,
                width,
            });
        }

        // This append was handed the final sequence; no other caller can be.
        let snapshot = self.store.snapshot(run_id).await?;
        match evaluate(&snapshot, width, &self.combine) {
            Evaluation::Complete { merged } => {
                self.retire(run_id).await;
                info!(run_id, width, "Barrier complete");
                Ok(Outcome::Complete { merged, width })
            }
            Evaluation::Overrun { arrived } => Err(BarrierError::Overrun {
                run_id: run_id.to_string(),
                arrived,
                width,
            }),
            Evaluation::Waiting { arrived } => Err(BarrierError::Inconsistent {
                run_id: run_id.to_string(),
                arrived,
                width,
            }),
        }
    }

    /// Re-derive the merged event of a full run. Its completing response may
    /// never have reached the sender.
    async fn replay(&self, run_id: &str) -> Result<Outcome, BarrierError> {
        let width = self.width;
        let snapshot = self.store.snapshot(run_id).await?;
        match evaluate(&snapshot, width, &self.combine) {
            Evaluation::Complete { merged } => {
                // Under Delete the run is only still here if clearing failed.
                self.retire(run_id).await;
                info!(run_id, width, "Replaying merged event for redelivered contribution");
                Ok(Outcome::Replayed { merged, width })
            }
            Evaluation::Overrun { arrived } => Err(BarrierError::Overrun {
                run_id: run_id.to_string(),
                arrived,
                width,
            }),
            Evaluation::Waiting { arrived } => Err(BarrierError::Inconsistent {
                run_id: run_id.to_string(),
                arrived,
                width,
            }),
        }
    }

    async fn retire(&self, run_id: &str) {
        match self.retention {
            Retention::Delete => {
                if let Err(e) = self.store.clear(run_id).await {
                    warn!(run_id, error = %e, "Failed to clear completed run");
                }
            }
            Retention::Retain => {}
        }
    }
}
