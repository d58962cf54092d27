//! PgBarrierStore: collection-backed barrier state in Postgres.
//!
//! Every append upserts and locks the run row in one statement, so appends to
//! one run are serialized and sequence numbers are gap-free, even when a
//! concurrent `clear` deletes the row. Appends to different runs never
//! contend.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::BarrierStore;
use crate::types::{Arrival, Contribution, Snapshot};

const DEFAULT_RETIRED_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// PgBarrierStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgBarrierStore {
    pool: PgPool,
    retired_key_ttl: Duration,
}

impl PgBarrierStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retired_key_ttl: DEFAULT_RETIRED_KEY_TTL,
        }
    }

    /// Open a pool. Callers treat failure here as fatal; there is no retry.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// How long keys of cleared runs keep rejecting redeliveries.
    pub fn with_retired_key_ttl(mut self, ttl: Duration) -> Self {
        self.retired_key_ttl = ttl;
        self
    }

    /// Create the barrier tables if they don't exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BarrierStore for PgBarrierStore {
    async fn append(
        &self,
        run_id: &str,
        width: i64,
        contribution: Contribution,
    ) -> StoreResult<Arrival> {
        let mut tx = self.pool.begin().await?;

        // The no-op update makes the conflict path take the row lock too.
        let (run_width, arrived) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            INSERT INTO barrier_runs (run_id, width)
            VALUES ($1, $2)
            ON CONFLICT (run_id) DO UPDATE SET run_id = EXCLUDED.run_id
            RETURNING width, arrived
            "#,
        )
        .bind(run_id)
        .bind(width)
        .fetch_one(&mut *tx)
        .await?;

        // Early returns drop `tx`, rolling back a run row created above.
        if let Some(key) = contribution.key.as_deref() {
            let (retired,) = sqlx::query_as::<_, (bool,)>(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM barrier_retired_keys
                    WHERE run_id = $1 AND contribution_key = $2
                )
                "#,
            )
            .bind(run_id)
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

            if retired {
                debug!(run_id, key, "Contribution of a cleared run ignored");
                return Ok(Arrival::Retired);
            }
        }

        if run_width != width {
            return Err(StoreError::WidthMismatch {
                run_id: run_id.to_string(),
                expected: run_width,
                got: width,
            });
        }

        if let Some(key) = contribution.key.as_deref() {
            let (seen,) = sqlx::query_as::<_, (bool,)>(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM barrier_contributions
                    WHERE run_id = $1 AND contribution_key = $2
                )
                "#,
            )
            .bind(run_id)
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

            if seen {
                debug!(run_id, key, "Duplicate contribution ignored");
                return Ok(Arrival::Duplicate { arrived });
            }
        }

        if arrived >= run_width {
            return Err(StoreError::RunClosed {
                run_id: run_id.to_string(),
                width: run_width,
            });
        }

        let sequence = arrived + 1;

        sqlx::query(
            r#"
            INSERT INTO barrier_contributions (run_id, seq, contribution_key, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(sequence)
        .bind(&contribution.key)
        .bind(&contribution.payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE barrier_runs SET arrived = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(sequence)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Arrival::Accepted { sequence })
    }

    async fn snapshot(&self, run_id: &str) -> StoreResult<Snapshot> {
        let contributions = sqlx::query_as::<_, Contribution>(
            r#"
            SELECT seq, contribution_key, payload
            FROM barrier_contributions
            WHERE run_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let count = contributions.len() as i64;
        Ok(Snapshot {
            contributions,
            count,
        })
    }

    async fn clear(&self, run_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT 1 FROM barrier_runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO barrier_retired_keys (run_id, contribution_key)
            SELECT run_id, contribution_key
            FROM barrier_contributions
            WHERE run_id = $1 AND contribution_key IS NOT NULL
            ON CONFLICT (run_id, contribution_key) DO UPDATE SET retired_at = now()
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        // Contributions go with the run row (ON DELETE CASCADE).
        sqlx::query("DELETE FROM barrier_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        let pruned = sqlx::query(
            "DELETE FROM barrier_retired_keys WHERE retired_at < now() - make_interval(secs => $1)",
        )
        .bind(self.retired_key_ttl.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        if pruned > 0 {
            debug!(pruned, "Pruned expired retired keys");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for Contribution
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Contribution {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Contribution {
            sequence: row.try_get("seq")?,
            key: row.try_get("contribution_key")?,
            payload: row.try_get("payload")?,
        })
    }
}
