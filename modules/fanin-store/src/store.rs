//! The capability contract every barrier backend satisfies.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{Arrival, Contribution, Snapshot};

/// Shared barrier state, keyed by run id.
///
/// Implemented by `PgBarrierStore` (postgres), `FileBarrierStore` (one JSON
/// file per run) and `MemoryBarrierStore` (tests). Also implemented for
/// `Arc<S>` so a store can be shared between the engine and test assertions.
#[async_trait]
pub trait BarrierStore: Send + Sync {
    /// Conditionally record one contribution.
    ///
    /// Atomic with respect to every other `append` on the same run: a key
    /// retired by an earlier `clear` yields `Retired`, a key already present
    /// yields `Duplicate`, a run holding `width` contributions yields
    /// `RunClosed`, otherwise the contribution gets `sequence = arrived + 1`.
    /// The first append creates the run and fixes its width.
    async fn append(
        &self,
        run_id: &str,
        width: i64,
        contribution: Contribution,
    ) -> StoreResult<Arrival>;

    /// Everything recorded for the run so far. Empty if the run doesn't exist.
    async fn snapshot(&self, run_id: &str) -> StoreResult<Snapshot>;

    /// Drop the run's state, keeping its contribution keys as retired so a
    /// late redelivery can't reopen the run. Clearing a run that doesn't
    /// exist is a no-op.
    async fn clear(&self, run_id: &str) -> StoreResult<()>;
}

#[async_trait]
impl<S: BarrierStore + ?Sized> BarrierStore for Arc<S> {
    async fn append(
        &self,
        run_id: &str,
        width: i64,
        contribution: Contribution,
    ) -> StoreResult<Arrival> {
        (**self).append(run_id, width, contribution).await
    }

    async fn snapshot(&self, run_id: &str) -> StoreResult<Snapshot> {
        (**self).snapshot(run_id).await
    }

    async fn clear(&self, run_id: &str) -> StoreResult<()> {
        (**self).clear(run_id).await
    }
}
