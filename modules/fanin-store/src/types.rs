//! Core types for barrier state. Backend-agnostic.

use serde::{Deserialize, Serialize};

/// One invocation's partial result, as submitted toward a run.
///
/// `sequence` is 0 until a store accepts the contribution; the store assigns
/// it. `key` identifies the logical event so redeliveries can be recognized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub sequence: i64,
    pub key: Option<String>,
    pub payload: serde_json::Value,
}

impl Contribution {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            sequence: 0,
            key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub(crate) fn sequenced(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Result of an `append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Recorded with this sequence number (1-based, gap-free within a run).
    Accepted { sequence: i64 },
    /// The key was already recorded in this run. Nothing was written.
    Duplicate { arrived: i64 },
    /// The key belongs to an earlier run under the same id that completed
    /// and was cleared. Nothing was written and no run was created.
    Retired,
}

/// The contributions recorded for a run, in ascending sequence order.
///
/// For the file-backed store this holds a single contribution carrying the
/// running merge, and `count` is the sequence it has reached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub contributions: Vec<Contribution>,
    pub count: i64,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
