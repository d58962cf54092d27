//! In-memory barrier store for tests. No database required.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::BarrierStore;
use crate::types::{Arrival, Contribution, Snapshot};

#[derive(Debug)]
struct RunState {
    width: i64,
    contributions: Vec<Contribution>,
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, RunState>,
    // Retired keys are never pruned here.
    retired: HashMap<String, HashSet<String>>,
}

/// Collection-style store held in process memory. Thread-safe.
#[derive(Debug, Default)]
pub struct MemoryBarrierStore {
    inner: Mutex<Inner>,
}

impl MemoryBarrierStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run ids with live state (for test assertions).
    pub async fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.runs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BarrierStore for MemoryBarrierStore {
    async fn append(
        &self,
        run_id: &str,
        width: i64,
        contribution: Contribution,
    ) -> StoreResult<Arrival> {
        let mut inner = self.inner.lock().await;

        if let Some(key) = contribution.key.as_deref() {
            if inner
                .retired
                .get(run_id)
                .is_some_and(|keys| keys.contains(key))
            {
                return Ok(Arrival::Retired);
            }
        }

        let run = inner
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunState {
                width,
                contributions: Vec::new(),
            });

        if run.width != width {
            return Err(StoreError::WidthMismatch {
                run_id: run_id.to_string(),
                expected: run.width,
                got: width,
            });
        }

        let arrived = run.contributions.len() as i64;
        if let Some(key) = contribution.key.as_deref() {
            if run.contributions.iter().any(|c| c.key.as_deref() == Some(key)) {
                return Ok(Arrival::Duplicate { arrived });
            }
        }
        if arrived >= run.width {
            return Err(StoreError::RunClosed {
                run_id: run_id.to_string(),
                width: run.width,
            });
        }

        let sequence = arrived + 1;
        run.contributions.push(contribution.sequenced(sequence));
        Ok(Arrival::Accepted { sequence })
    }

    async fn snapshot(&self, run_id: &str) -> StoreResult<Snapshot> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .get(run_id)
            .map(|run| Snapshot {
                contributions: run.contributions.clone(),
                count: run.contributions.len() as i64,
            })
            .unwrap_or_default())
    }

    async fn clear(&self, run_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.runs.remove(run_id) {
            let keys = run.contributions.into_iter().filter_map(|c| c.key);
            inner
                .retired
                .entry(run_id.to_string())
                .or_default()
                .extend(keys);
        }
        Ok(())
    }
}
