//! SQLite coordinator
//!
//! Lock table in a database file on the shared volume. Every operation is a
//! single statement, so SQLite's write lock makes the check-and-set atomic
//! across all processes that open the same file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::backend::{Acquire, Coordinator, LockHandle, LockRecord, Renewal, lease_expiry};
use super::error::CoordinationResult;
use crate::storage::sqlite::{from_millis, open_pool, to_millis};

pub struct SqliteCoordinator {
    pool: SqlitePool,
}

impl SqliteCoordinator {
    pub async fn new(db_path: impl AsRef<Path>) -> CoordinationResult<Self> {
        let pool = open_pool(db_path).await?;
        Ok(Self { pool })
    }

    /// Use an already opened pool (e.g. shared with the metadata store)
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Coordinator for SqliteCoordinator {
    #[instrument(skip(self))]
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> CoordinationResult<Acquire> {
        let now = to_millis(&Utc::now());
        let expires_at = lease_expiry(lease);

        // Takes the row when it is free, expired, or already ours; a live
        // lease of the same owner keeps its token.
        let result = sqlx::query(
            r#"
            INSERT INTO locks (key, owner, token, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                token = CASE
                    WHEN locks.owner = excluded.owner AND locks.expires_at > ? THEN locks.token
                    ELSE excluded.token
                END,
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ? OR locks.owner = excluded.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(Uuid::new_v4().to_string())
        .bind(to_millis(&expires_at))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let holder = sqlx::query_scalar::<_, String>("SELECT owner FROM locks WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            trace!("{key} busy, held by {holder:?}");
            return Ok(Acquire::Busy { holder });
        }

        let token: String =
            sqlx::query_scalar("SELECT token FROM locks WHERE key = ? AND owner = ?")
                .bind(key)
                .bind(owner)
                .fetch_one(&self.pool)
                .await?;

        debug!("acquired {key}");
        Ok(Acquire::Acquired(LockHandle {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            expires_at,
        }))
    }

    #[instrument(skip(self, handle), fields(key = %handle.key))]
    async fn renew(&self, handle: &LockHandle, lease: Duration) -> CoordinationResult<Renewal> {
        let expires_at = lease_expiry(lease);

        let result = sqlx::query(
            "UPDATE locks SET expires_at = ? WHERE key = ? AND owner = ? AND token = ?",
        )
        .bind(to_millis(&expires_at))
        .bind(&handle.key)
        .bind(&handle.owner)
        .bind(&handle.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(Renewal::Lost);
        }

        Ok(Renewal::Renewed { expires_at })
    }

    #[instrument(skip(self, handle), fields(key = %handle.key))]
    async fn release(&self, handle: &LockHandle) -> CoordinationResult<()> {
        sqlx::query("DELETE FROM locks WHERE key = ? AND owner = ? AND token = ?")
            .bind(&handle.key)
            .bind(&handle.owner)
            .bind(&handle.token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn holder(&self, key: &str) -> CoordinationResult<Option<LockRecord>> {
        let row = sqlx::query("SELECT owner, expires_at FROM locks WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(to_millis(&Utc::now()))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| -> Result<LockRecord, sqlx::Error> {
                Ok(LockRecord {
                    key: key.to_string(),
                    owner: row.try_get("owner")?,
                    expires_at: from_millis(row.try_get("expires_at")?),
                })
            })
            .transpose()?)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
