//! Postgres-backed `MessageQueue`.
//!
//! Messages are rows of the `job_queue` table.  Workers poll the table and
//! use `SELECT … FOR UPDATE SKIP LOCKED` for safe concurrent processing.
//! Delayed delivery is expressed through the `available_at` column.
//!
//! A `processing` row whose `updated_at` is older than the visibility
//! timeout belongs to a consumer that died mid-delivery and is handed out
//! again.  Rows whose payload no longer decodes are dead-lettered at fetch
//! time.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::{Delivery, MessageQueue, QueueError};

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Default time a delivery may stay `processing` before it is reclaimed.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    attempts: i32,
    max_attempts: i32,
    payload: serde_json::Value,
}

#[derive(Debug)]
pub struct PgQueue<M> {
    pool: PgPool,
    max_attempts: i32,
    visibility_timeout: Duration,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for PgQueue<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            max_attempts: self.max_attempts,
            visibility_timeout: self.visibility_timeout,
            _message: PhantomData,
        }
    }
}

impl<M> PgQueue<M> {
    pub fn new(pool: PgPool) -> Self {
        Self::with_max_attempts(pool, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(pool: PgPool, max_attempts: i32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            _message: PhantomData,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Latest `updated_at` at which a `processing` row counts as abandoned.
fn reclaim_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

enum Claim<M> {
    Deliver(Delivery<M>),
    DeadLetter(String),
}

/// Pending rows are always below `max_attempts`; a reclaimed row at the
/// limit was abandoned on its last attempt.
fn claim<M: DeserializeOwned>(job: JobRow) -> Claim<M> {
    if job.attempts >= job.max_attempts {
        return Claim::DeadLetter(format!("abandoned after {} attempts", job.attempts));
    }
    match serde_json::from_value(job.payload) {
        Ok(message) => Claim::Deliver(Delivery {
            id: job.id,
            queue: job.queue,
            message,
            attempts: (job.attempts + 1).max(0) as u32,
        }),
        Err(e) => Claim::DeadLetter(format!("undecodable payload: {e}")),
    }
}

#[async_trait]
impl<M> MessageQueue<M> for PgQueue<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    async fn send_with_delay(
        &self,
        queue: &str,
        message: M,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_value(&message)?;
        let now = Utc::now();
        let available_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        sqlx::query(
            r#"
            INSERT INTO job_queue
                (id, queue, status, attempts, max_attempts, payload, available_at, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue)
        .bind(self.max_attempts)
        .bind(payload)
        .bind(available_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically fetch the oldest deliverable job and mark it as `processing`.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery<M>>, QueueError> {
        let mut tx = self.pool.begin().await?;

        loop {
            let now = Utc::now();
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT id, queue, attempts, max_attempts, payload
                FROM job_queue
                WHERE queue = $1
                  AND ((status = 'pending' AND available_at <= $2)
                    OR (status = 'processing' AND updated_at <= $3))
                ORDER BY available_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(queue)
            .bind(now)
            .bind(reclaim_cutoff(now, self.visibility_timeout))
            .fetch_optional(&mut *tx)
            .await?;

            // Commit: rows dead-lettered on earlier iterations stay so.
            let Some(job) = row else {
                tx.commit().await?;
                return Ok(None);
            };
            let id = job.id;

            match claim::<M>(job) {
                Claim::Deliver(delivery) => {
                    sqlx::query(
                        r#"
                        UPDATE job_queue
                        SET status = 'processing', attempts = attempts + 1, updated_at = $1
                        WHERE id = $2
                        "#,
                    )
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(delivery));
                }
                Claim::DeadLetter(reason) => {
                    warn!(job_id = %id, %reason, "message dead-lettered");
                    sqlx::query(
                        "UPDATE job_queue SET status = 'dead_lettered', updated_at = $1 WHERE id = $2",
                    )
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
    }

    /// Mark a job as completed.
    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let updated = sqlx::query(
            "UPDATE job_queue SET status = 'completed', updated_at = $1 WHERE id = $2 AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(QueueError::UnknownDelivery(id));
        }
        Ok(())
    }

    /// Return a job to `pending`, or dead-letter it once `max_attempts` is reached.
    async fn fail(&self, id: Uuid) -> Result<(), QueueError> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE job_queue
            SET status = CASE WHEN attempts >= max_attempts THEN 'dead_lettered' ELSE 'pending' END,
                available_at = $1,
                updated_at = $1
            WHERE id = $2 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::UnknownDelivery(id))?;

        if status == "dead_lettered" {
            warn!(job_id = %id, "message dead-lettered");
        }
        Ok(())
    }
}
