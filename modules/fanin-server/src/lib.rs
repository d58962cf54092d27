//! HTTP receivers for the fan-in barrier.
//!
//! `fanin-aggregator` accepts CloudEvents from N parallel stages and forwards
//! a single merged event once all N have arrived. `fanin-stage` is the
//! template for those stages.

pub mod cloudevent;
pub mod config;
pub mod data;
pub mod routes;
pub mod shutdown;
pub mod stage;

pub use cloudevent::{CloudEvent, EventError, Mode};
pub use config::{AppConfig, StageConfig, StoreBackend};
pub use data::{MergeMode, MessageData, PayloadData};
pub use routes::{build_router, AppState, DynBarrier};
pub use shutdown::Shutdown;
pub use stage::{build_stage_router, MessageStage, Stage, StageState};
