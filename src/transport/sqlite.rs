//! SQLite durable queue
//!
//! Message table on the shared volume. A receive is one
//! `UPDATE ... RETURNING` that stamps a fresh receipt on the oldest visible
//! row, so two consumers (in any process) can never take the same delivery.
//! Consumers poll; publishes from the same process wake local consumers
//! immediately.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::backend::{
    DeadLetter, Delivery, Destination, Envelope, NackReason, PublishOptions, Transport,
};
use super::error::{TransportError, TransportResult};
use crate::storage::sqlite::{from_millis, open_pool, to_millis};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct SqliteTransport {
    pool: SqlitePool,
    notify: Notify,
    visibility_timeout: Duration,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn parse_id(id: &str) -> TransportResult<Uuid> {
    Uuid::parse_str(id).map_err(|e| TransportError::Backend(format!("invalid message id: {e}")))
}

impl SqliteTransport {
    pub async fn new(db_path: impl AsRef<Path>, visibility_timeout: Duration) -> TransportResult<Self> {
        let pool = open_pool(db_path).await?;
        Ok(Self::with_pool(pool, visibility_timeout))
    }

    pub fn with_pool(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    async fn try_take(&self, queue: &str) -> TransportResult<Option<Delivery>> {
        let now = Utc::now();
        let receipt = Uuid::new_v4().to_string();

        let row = sqlx::query(
            r#"
            UPDATE messages
            SET receipt = ?, deliveries = deliveries + 1, visible_at = ?
            WHERE rowid = (
                SELECT rowid FROM messages
                WHERE queue = ? AND visible_at <= ?
                ORDER BY visible_at, published_at
                LIMIT 1
            )
            RETURNING id, body, published_at, deliveries, failures, contended
            "#,
        )
        .bind(&receipt)
        .bind(to_millis(&now) + millis(self.visibility_timeout))
        .bind(queue)
        .bind(to_millis(&now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_delivery(&row, queue, receipt))
            .transpose()
    }

    fn row_to_delivery(row: &SqliteRow, queue: &str, receipt: String) -> TransportResult<Delivery> {
        let id: String = row.try_get("id")?;
        let body: String = row.try_get("body")?;

        Ok(Delivery {
            queue: queue.to_string(),
            envelope: Envelope {
                id: parse_id(&id)?,
                body: serde_json::from_str(&body)?,
                published_at: from_millis(row.try_get("published_at")?),
            },
            deliveries: row.try_get::<i64, _>("deliveries")? as u32,
            failures: row.try_get::<i64, _>("failures")? as u32,
            contended: row.try_get::<i64, _>("contended")? as u32,
            receipt,
        })
    }

    fn row_to_dead_letter(row: &SqliteRow) -> TransportResult<DeadLetter> {
        let id: String = row.try_get("id")?;
        let body: String = row.try_get("body")?;

        Ok(DeadLetter {
            id: parse_id(&id)?,
            queue: row.try_get("queue")?,
            body: serde_json::from_str(&body)?,
            published_at: from_millis(row.try_get("published_at")?),
            dead_lettered_at: from_millis(row.try_get("dead_lettered_at")?),
            deliveries: row.try_get::<i64, _>("deliveries")? as u32,
            failures: row.try_get::<i64, _>("failures")? as u32,
            reason: row.try_get("reason")?,
        })
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    #[instrument(skip(self, envelope), fields(id = %envelope.id))]
    async fn publish(
        &self,
        destination: &Destination,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> TransportResult<()> {
        let body = serde_json::to_string(&envelope.body)?;
        let visible_at = to_millis(&Utc::now()) + millis(options.delay);

        let mut tx = self.pool.begin().await?;

        let queues: Vec<String> = match destination {
            Destination::Queue(queue) => vec![queue.clone()],
            Destination::Topic(topic) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT queue FROM bindings WHERE topic = ? ORDER BY queue",
                )
                .bind(topic)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        if queues.is_empty() {
            debug!("no queue bound to {destination}, message dropped");
        }

        for queue in &queues {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO messages (id, queue, body, published_at, visible_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(envelope.id.to_string())
            .bind(queue)
            .bind(&body)
            .bind(to_millis(&envelope.published_at))
            .bind(visible_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                trace!("duplicate publish to {queue} ignored");
            }
        }

        tx.commit().await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn bind(&self, topic: &str, queue: &str) -> TransportResult<()> {
        sqlx::query("INSERT OR IGNORE INTO bindings (topic, queue) VALUES (?, ?)")
            .bind(topic)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> TransportResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Other processes publish too; poll in addition to the local wakeup.
            let wake_at = (now + POLL_INTERVAL).min(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        let result = sqlx::query("DELETE FROM messages WHERE queue = ? AND id = ? AND receipt = ?")
            .bind(&delivery.queue)
            .bind(delivery.id().to_string())
            .bind(&delivery.receipt)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!("ack of {} with stale receipt ignored", delivery.id());
        }
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: NackReason,
    ) -> TransportResult<()> {
        let (contended, failures, error): (i64, i64, Option<String>) = match reason {
            NackReason::Contended => (1, 0, None),
            NackReason::Failed(error) => (0, 1, Some(error)),
            NackReason::Released => (0, 0, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET receipt = NULL,
                visible_at = ?,
                contended = contended + ?,
                failures = failures + ?,
                last_error = COALESCE(?, last_error)
            WHERE queue = ? AND id = ? AND receipt = ?
            "#,
        )
        .bind(to_millis(&Utc::now()) + millis(delay))
        .bind(contended)
        .bind(failures)
        .bind(error)
        .bind(&delivery.queue)
        .bind(delivery.id().to_string())
        .bind(&delivery.receipt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("nack of {} with stale receipt ignored", delivery.id());
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> TransportResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET visible_at = ? WHERE queue = ? AND id = ? AND receipt = ?",
        )
        .bind(to_millis(&Utc::now()) + millis(visibility))
        .bind(&delivery.queue)
        .bind(delivery.id().to_string())
        .bind(&delivery.receipt)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, delivery), fields(id = %delivery.id(), queue = %delivery.queue))]
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        failures: u32,
        reason: &str,
    ) -> TransportResult<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM messages WHERE queue = ? AND id = ? AND receipt = ?")
            .bind(&delivery.queue)
            .bind(delivery.id().to_string())
            .bind(&delivery.receipt)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            debug!("dead-letter with stale receipt ignored");
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters
                (id, queue, body, published_at, dead_lettered_at, deliveries, failures, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(delivery.id().to_string())
        .bind(&delivery.queue)
        .bind(serde_json::to_string(&delivery.envelope.body)?)
        .bind(to_millis(&delivery.envelope.published_at))
        .bind(to_millis(&Utc::now()))
        .bind(i64::from(delivery.deliveries))
        .bind(i64::from(failures))
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn dead_letters(&self, queue: Option<&str>) -> TransportResult<Vec<DeadLetter>> {
        let rows = match queue {
            Some(queue) => {
                sqlx::query(
                    "SELECT * FROM dead_letters WHERE queue = ? ORDER BY dead_lettered_at DESC",
                )
                .bind(queue)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM dead_letters ORDER BY dead_lettered_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    async fn pending(&self, queue: &str) -> TransportResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
