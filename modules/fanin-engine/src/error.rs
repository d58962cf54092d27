use fanin_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarrierError {
    /// Width must be at least 1
    #[error("invalid barrier width {0}")]
    InvalidWidth(i64),

    /// The run already received all of its contributions
    #[error("run {run_id} already complete ({width} of {width})")]
    RunClosed { run_id: String, width: i64 },

    /// The store holds more contributions than the width allows
    #[error("run {run_id} overran: {arrived} contributions for width {width}")]
    Overrun {
        run_id: String,
        arrived: i64,
        width: i64,
    },

    /// The final sequence was assigned but the snapshot disagrees
    #[error("run {run_id} closed at {width} but snapshot holds {arrived}")]
    Inconsistent {
        run_id: String,
        arrived: i64,
        width: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BarrierError {
    /// Errors that should take the whole process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BarrierError::Store(e) if e.is_fatal())
    }
}
