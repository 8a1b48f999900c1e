//! Durable job broker.
//!
//! The dispatcher consumes post jobs through this interface: durable
//! enqueue with optional delay and deduplication, claim with a visibility
//! timeout, ack on completion, nack to reschedule. `enqueue` takes the
//! caller's open connection so schedule firing can materialize posts and
//! enqueue their jobs in one transaction (the outbox guarantee: both
//! durable, or neither observable).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::Result;

/// Queue name for per-post publish jobs.
pub const POST_QUEUE: &str = "post_jobs";

/// Payload of a publish job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostJob {
    pub post_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Duration,
    /// Jobs sharing a dedup key within the retention window collapse into one.
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub handle: JobHandle,
    pub payload: String,
    pub delivery_count: i64,
}

#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Durably enqueue within the caller's transaction.
    async fn enqueue(
        &self,
        conn: &mut SqliteConnection,
        queue: &str,
        payload: &str,
        opts: EnqueueOptions,
    ) -> Result<()>;

    /// Claim the next available job, making it invisible for `visibility`.
    /// At-least-once: a crashed worker's job reappears after the timeout.
    async fn claim(&self, queue: &str, visibility: Duration) -> Result<Option<ClaimedJob>>;

    /// Acknowledge (delete) a completed job.
    async fn ack(&self, handle: &JobHandle) -> Result<()>;

    /// Return a job to the queue, delayed by `requeue_delay`.
    async fn nack(&self, handle: &JobHandle, requeue_delay: Duration) -> Result<()>;
}

/// Broker backed by the `jobs` table of the primary database.
pub struct SqliteBroker {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteBroker {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    #[cfg(test)]
    pub async fn pending_count(&self, queue: &str) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM jobs WHERE queue = ?")
            .bind(queue)
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl JobBroker for SqliteBroker {
    async fn enqueue(
        &self,
        conn: &mut SqliteConnection,
        queue: &str,
        payload: &str,
        opts: EnqueueOptions,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let available_at = now + opts.delay.as_millis() as i64;

        let res = sqlx::query(
            "INSERT INTO jobs (id, queue, payload, dedup_key, available_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (dedup_key) DO NOTHING",
        )
        .bind(self.clock.new_id().to_string())
        .bind(queue)
        .bind(payload)
        .bind(&opts.dedup_key)
        .bind(available_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if res.rows_affected() == 0 {
            tracing::debug!(queue, dedup_key = ?opts.dedup_key, "deduplicated enqueue");
        }
        Ok(())
    }

    async fn claim(&self, queue: &str, visibility: Duration) -> Result<Option<ClaimedJob>> {
        let now = self.clock.now_ms();
        let locked_until = now + visibility.as_millis() as i64;

        // Conditional update doubles as the lock: only one claimant can move
        // the row's locked_until past now.
        let row = sqlx::query(
            "UPDATE jobs
             SET locked_until = ?, delivery_count = delivery_count + 1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue = ? AND available_at <= ?
                   AND (locked_until IS NULL OR locked_until <= ?)
                 ORDER BY available_at
                 LIMIT 1
             )
             RETURNING id, payload, delivery_count",
        )
        .bind(locked_until)
        .bind(queue)
        .bind(now)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|r| ClaimedJob {
            handle: JobHandle {
                id: r.get("id"),
                queue: queue.to_string(),
            },
            payload: r.get("payload"),
            delivery_count: r.get("delivery_count"),
        }))
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(&handle.id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn nack(&self, handle: &JobHandle, requeue_delay: Duration) -> Result<()> {
        let available_at = self.clock.now_ms() + requeue_delay.as_millis() as i64;
        sqlx::query("UPDATE jobs SET locked_until = NULL, available_at = ? WHERE id = ?")
            .bind(available_at)
            .bind(&handle.id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
