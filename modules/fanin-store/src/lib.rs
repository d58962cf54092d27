//! Shared barrier state for fan-in aggregation.
//!
//! Every invocation of the aggregator is stateless. The only coordination
//! point between concurrent invocations is a `BarrierStore`, which assigns
//! each accepted contribution a sequence number atomically. The sequence is
//! the fencing token: whoever is handed sequence N owns the completion.
//!
//! Three adapters ship here: Postgres (collection-backed), a single JSON file
//! per run (file-backed) and an in-memory map for tests.

pub mod error;
pub mod file;
pub mod memory;
pub mod merge;
pub mod postgres;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use file::{CorruptStatePolicy, FileBarrierStore, RETIRED_KEYS_MAX};
pub use memory::MemoryBarrierStore;
pub use merge::{fold, Combine, Concat, MergePayload};
pub use postgres::PgBarrierStore;
pub use store::BarrierStore;
pub use types::{Arrival, Contribution, Snapshot};
