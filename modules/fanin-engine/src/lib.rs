//! Fan-in barrier engine.
//!
//! `evaluate` decides, from a store snapshot and the barrier width, whether a
//! run is complete and computes the merge. `Barrier` drives it against a
//! `BarrierStore`: append, and if this append was handed the final sequence,
//! snapshot → evaluate → retire the run.

pub mod barrier;
pub mod error;
pub mod evaluate;

pub use barrier::{Barrier, Outcome, Retention};
pub use error::BarrierError;
pub use evaluate::{evaluate, Evaluation};
