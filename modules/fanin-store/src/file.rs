//! FileBarrierStore: one JSON file per run holding the running merge.
//!
//! Layout of `<dir>/<run_id>.json`:
//!
//! ```json
//! { "id": 2, "message": "x y", "seen": ["src/1", "src/2"] }
//! ```
//!
//! `id` is the sequence reached so far; the remaining fields are the merged
//! payload. `seen` holds idempotency keys and is omitted when empty. The file
//! existing means a run is in progress.
//!
//! Clearing a run moves its keys into `<dir>/<run_id>.done`, capped at
//! `RETIRED_KEYS_MAX` of the most recent, so late redeliveries are answered
//! `Retired` instead of opening a new run.
//!
//! Read-modify-write cycles are serialized by `<run_id>.lock`, created with
//! `create_new` and holding the owner's pid, a token and the acquisition
//! time. A lock older than `stale_after` is assumed to belong to a dead
//! process and is broken. New state is written to a temp file and renamed
//! into place, so a reader never observes a partial write.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::merge::Combine;
use crate::store::BarrierStore;
use crate::types::{Arrival, Contribution, Snapshot};

const LOCK_POLL: Duration = Duration::from_millis(5);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Retired keys kept per run id.
pub const RETIRED_KEYS_MAX: usize = 1024;

/// What to do when a persisted run file can't be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorruptStatePolicy {
    /// Discard the file and start the run over.
    #[default]
    Reset,
    /// Surface `StoreError::Corrupt`, which callers treat as fatal.
    Fail,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunFile {
    id: i64,
    #[serde(flatten)]
    merged: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    seen: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RetiredKeys {
    keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockMeta {
    token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FileBarrierStore {
    dir: PathBuf,
    combine: Arc<dyn Combine>,
    policy: CorruptStatePolicy,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl FileBarrierStore {
    /// Use `dir` for run files, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>, combine: impl Combine + 'static) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            combine: Arc::new(combine),
            policy: CorruptStatePolicy::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_LOCK_STALE_AFTER,
        })
    }

    pub fn with_policy(mut self, policy: CorruptStatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Age after which a run lock is treated as abandoned. Must exceed the
    /// longest a healthy holder keeps it.
    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Path of the state file for `run_id`.
    pub fn run_path(&self, run_id: &str) -> StoreResult<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    fn retired_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.done"))
    }

    async fn lock(&self, run_id: &str) -> StoreResult<RunLock> {
        let path = self.dir.join(format!("{run_id}.lock"));
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let meta = LockMeta {
                token: Uuid::new_v4().to_string(),
                pid: std::process::id(),
                acquired_at: Utc::now(),
            };
            let bytes = serde_json::to_vec(&meta).map_err(StoreError::Encode)?;
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let lock = RunLock {
                        path: path.clone(),
                        token: meta.token,
                        released: false,
                    };
                    if let Err(e) = write_lock(&mut file, &bytes).await {
                        lock.release().await;
                        return Err(e.into());
                    }
                    return Ok(lock);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.break_if_stale(&path).await? {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout {
                            run_id: run_id.to_string(),
                        });
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock at `path` if its holder is presumed dead. Returns true
    /// when the caller should retry acquisition right away.
    async fn break_if_stale(&self, path: &Path) -> StoreResult<bool> {
        let observed = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let holder = serde_json::from_slice::<LockMeta>(&observed).ok();
        let age = match &holder {
            Some(meta) => (Utc::now() - meta.acquired_at).to_std().unwrap_or_default(),
            // Crashed before writing metadata, or still writing it.
            None => match tokio::fs::metadata(path).await {
                Ok(m) => m
                    .modified()
                    .ok()
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or_default(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(e.into()),
            },
        };
        if age < self.stale_after {
            return Ok(false);
        }

        // Move the lock aside, then make sure it is the one judged stale and
        // not one taken in the meantime.
        let aside = self.dir.join(format!(".{}.stale", Uuid::new_v4()));
        match tokio::fs::rename(path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        let moved = tokio::fs::read(&aside).await?;
        if moved == observed {
            tokio::fs::remove_file(&aside).await?;
            warn!(
                path = %path.display(),
                holder_pid = ?holder.as_ref().map(|m| m.pid),
                age_ms = age.as_millis() as u64,
                "Broke stale run lock"
            );
            return Ok(true);
        }

        // A live holder's lock; put it back unless someone else got in.
        match tokio::fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "Run lock changed hands while breaking it");
            }
            Err(_) => tokio::fs::rename(&aside, path).await?,
        }
        let _ = tokio::fs::remove_file(&aside).await;
        Ok(false)
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(source) => match self.policy {
                CorruptStatePolicy::Reset => {
                    warn!(path = %path.display(), error = %source, "Discarding corrupt run state");
                    Ok(None)
                }
                CorruptStatePolicy::Fail => Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                }),
            },
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let mut bytes = serde_json::to_vec(value).map_err(StoreError::Encode)?;
        bytes.push(b'\n');
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn is_retired(&self, run_id: &str, key: &str) -> StoreResult<bool> {
        let retired: Option<RetiredKeys> = self.read_json(&self.retired_path(run_id)).await?;
        Ok(retired.is_some_and(|r| r.keys.iter().any(|k| k == key)))
    }

    async fn append_locked(
        &self,
        run_id: &str,
        path: &Path,
        width: i64,
        contribution: Contribution,
    ) -> StoreResult<Arrival> {
        let (arrived, merged, mut seen) = match self.read_json::<RunFile>(path).await? {
            Some(run) => (run.id, Some(run.merged), run.seen),
            None => (0, None, Vec::new()),
        };

        if let Some(key) = contribution.key.as_deref() {
            if seen.iter().any(|k| k == key) {
                return Ok(Arrival::Duplicate { arrived });
            }
            if self.is_retired(run_id, key).await? {
                return Ok(Arrival::Retired);
            }
        }
        if arrived >= width {
            return Err(StoreError::RunClosed {
                run_id: run_id.to_string(),
                width,
            });
        }

        let merged = match merged {
            Some(prev) => self
                .combine
                .combine(Value::Object(prev), &contribution.payload),
            None => contribution.payload,
        };
        if let Some(key) = contribution.key {
            seen.push(key);
        }

        let sequence = arrived + 1;
        let run = RunFile {
            id: sequence,
            merged: into_state_fields(merged),
            seen,
        };
        self.write_json(path, &run).await?;
        debug!(run_id, sequence, path = %path.display(), "Run file written");

        Ok(Arrival::Accepted { sequence })
    }

    async fn clear_locked(&self, run_id: &str, path: &Path) -> StoreResult<()> {
        if let Some(run) = self.read_json::<RunFile>(path).await? {
            if !run.seen.is_empty() {
                let retired_path = self.retired_path(run_id);
                let mut retired: RetiredKeys =
                    self.read_json(&retired_path).await?.unwrap_or_default();
                retired.keys.extend(run.seen);
                let excess = retired.keys.len().saturating_sub(RETIRED_KEYS_MAX);
                retired.keys.drain(..excess);
                // Keys go first: a crash here leaves a full run, not a reopened one.
                self.write_json(&retired_path, &retired).await?;
            }
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BarrierStore for FileBarrierStore {
    async fn append(
        &self,
        run_id: &str,
        width: i64,
        contribution: Contribution,
    ) -> StoreResult<Arrival> {
        let path = self.run_path(run_id)?;
        let lock = self.lock(run_id).await?;
        let result = self.append_locked(run_id, &path, width, contribution).await;
        lock.release().await;
        result
    }

    async fn snapshot(&self, run_id: &str) -> StoreResult<Snapshot> {
        let path = self.run_path(run_id)?;
        let Some(run) = self.read_json::<RunFile>(&path).await? else {
            return Ok(Snapshot::default());
        };

        let mut payload = run.merged;
        payload.insert("id".into(), Value::from(run.id));
        Ok(Snapshot {
            contributions: vec![Contribution::new(Value::Object(payload)).sequenced(run.id)],
            count: run.id,
        })
    }

    async fn clear(&self, run_id: &str) -> StoreResult<()> {
        let path = self.run_path(run_id)?;
        let lock = self.lock(run_id).await?;
        let result = self.clear_locked(run_id, &path).await;
        lock.release().await;
        result
    }
}

async fn write_lock(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// Held while a run file is being read and rewritten. Removing the lock file
/// releases it.
struct RunLock {
    path: PathBuf,
    token: String,
    released: bool,
}

impl RunLock {
    fn owns(&self, bytes: &[u8]) -> bool {
        serde_json::from_slice::<LockMeta>(bytes).is_ok_and(|meta| meta.token == self.token)
    }

    async fn release(mut self) {
        self.released = true;
        match tokio::fs::read(&self.path).await {
            // Still empty if the metadata write failed.
            Ok(bytes) if bytes.is_empty() || self.owns(&bytes) => {
                if let Err(e) = tokio::fs::remove_file(&self.path).await {
                    warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
                }
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "Run lock was broken while held");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
            }
        }
    }
}

impl Drop for RunLock {
    // Only reached when the holding future is cancelled. Blocks the worker
    // for one read and one unlink.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(bytes) = std::fs::read(&self.path) {
            if self.owns(&bytes) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

/// Merged payload fields to persist. `id` and `seen` are owned by the file.
fn into_state_fields(merged: Value) -> Map<String, Value> {
    let mut fields = match merged {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    };
    fields.remove("id");
    fields.remove("seen");
    fields
}

fn validate_run_id(run_id: &str) -> StoreResult<()> {
    let valid = !run_id.is_empty()
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRunId(run_id.to_string()))
    }
}
