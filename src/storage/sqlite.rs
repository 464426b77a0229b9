//! SQLite metadata store
//!
//! The database file lives on the shared metadata volume, so every role that
//! mounts the volume sees the same registry.
//!
//! ## Features
//!
//! - **WAL mode**: readers do not block the writer
//! - **Busy timeout**: concurrent writers from other role processes wait
//!   instead of failing immediately
//! - **Migrations**: one embedded migration set for metadata, lock and queue
//!   tables (see [`open_pool`])

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::backend::{HealthStatus, MetadataStore};
use super::error::{StorageError, StorageResult};
use super::schema::{StorageRecord, StorageStatus, SyncStatus};
use crate::{AlertEvent, Severity};

/// Open (and migrate) a SQLite pool at `path`
///
/// Shared by the metadata store and the SQLite coordination and transport
/// backends.
#[instrument(skip_all)]
pub async fn open_pool(path: impl AsRef<Path>) -> StorageResult<SqlitePool> {
    let path = path.as_ref();
    info!("opening SQLite database at: {}", path.display());

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

    debug!("running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// `SQLITE_BUSY` / `SQLITE_LOCKED` (and their extended codes)
pub fn is_busy(err: &dyn sqlx::error::DatabaseError) -> bool {
    let code_busy = matches!(
        err.code().as_deref(),
        Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
    );
    code_busy || err.message().contains("database is locked")
}

pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// SQLite metadata store
pub struct SqliteStore {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();
        let pool = open_pool(db_path).await?;

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn row_to_record(row: &SqliteRow) -> StorageResult<StorageRecord> {
        let status: String = row.try_get("status")?;
        let status = StorageStatus::parse(&status).ok_or_else(|| {
            StorageError::SerializationError(format!("unknown storage status '{status}'"))
        })?;

        Ok(StorageRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            vendor: row.try_get("vendor")?,
            model: row.try_get("model")?,
            serial_number: row.try_get("serial_number")?,
            status,
            sync_status: SyncStatus::from_i64(row.try_get("sync_status")?),
            total_capacity: row.try_get::<i64, _>("total_capacity")? as u64,
            used_capacity: row.try_get::<i64, _>("used_capacity")? as u64,
            pool_count: row.try_get::<i64, _>("pool_count")? as u32,
            volume_count: row.try_get::<i64, _>("volume_count")? as u32,
            created_at: from_millis(row.try_get("created_at")?),
            last_synced_at: row
                .try_get::<Option<i64>, _>("last_synced_at")?
                .map(from_millis),
        })
    }

    fn row_to_alert(row: &SqliteRow) -> StorageResult<AlertEvent> {
        let id: String = row.try_get("id")?;
        let severity: String = row.try_get("severity")?;

        Ok(AlertEvent {
            id: id
                .parse()
                .map_err(|e| StorageError::SerializationError(format!("bad alert id: {e}")))?,
            severity: severity
                .parse::<Severity>()
                .map_err(StorageError::SerializationError)?,
            source: row.try_get("source")?,
            timestamp: from_millis(row.try_get("timestamp")?),
            message: row.try_get("message")?,
            storage_name: row.try_get("storage_name")?,
            vendor: row.try_get("vendor")?,
            model: row.try_get("model")?,
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    #[instrument(skip(self))]
    async fn get_storage(&self, id: &str) -> StorageResult<Option<StorageRecord>> {
        let row = sqlx::query("SELECT * FROM storages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn upsert_storage(&self, record: StorageRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO storages (
                id, name, vendor, model, serial_number, status, sync_status,
                total_capacity, used_capacity, pool_count, volume_count,
                created_at, last_synced_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                vendor = excluded.vendor,
                model = excluded.model,
                serial_number = excluded.serial_number,
                status = excluded.status,
                sync_status = excluded.sync_status,
                total_capacity = excluded.total_capacity,
                used_capacity = excluded.used_capacity,
                pool_count = excluded.pool_count,
                volume_count = excluded.volume_count,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.vendor)
        .bind(&record.model)
        .bind(&record.serial_number)
        .bind(record.status.as_str())
        .bind(record.sync_status.as_i64())
        .bind(record.total_capacity as i64)
        .bind(record.used_capacity as i64)
        .bind(i64::from(record.pool_count))
        .bind(i64::from(record.volume_count))
        .bind(to_millis(&record.created_at))
        .bind(record.last_synced_at.as_ref().map(to_millis))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_sync_status(&self, id: &str, status: SyncStatus) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE storages SET sync_status = ? WHERE id = ?")
            .bind(status.as_i64())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_storage(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM storages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_storages(&self) -> StorageResult<Vec<StorageRecord>> {
        let rows = sqlx::query("SELECT * FROM storages ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    #[instrument(skip(self, event), fields(id = %event.id, source = %event.source))]
    async fn insert_alert(&self, event: &AlertEvent) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO alerts (
                id, source, severity, timestamp, message, storage_name, vendor, model
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.source)
        .bind(event.severity.as_str())
        .bind(to_millis(&event.timestamp))
        .bind(&event.message)
        .bind(&event.storage_name)
        .bind(&event.vendor)
        .bind(&event.model)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_alerts(&self, source: &str, limit: usize) -> StorageResult<Vec<AlertEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE source = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_alert).collect()
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let storages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storages")
            .fetch_one(&self.pool)
            .await?;

        Ok(HealthStatus {
            healthy: true,
            message: "SQLite metadata store operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "sqlite".to_string()),
                ("path".to_string(), self.db_path.clone()),
                ("storages".to_string(), storages.to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite metadata store");
        self.pool.close().await;
        Ok(())
    }
}
