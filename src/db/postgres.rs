use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use tracing::{debug, info};

use super::{
    health_check, CancelOutcome, CancellationEvent, CancellationStream, CancellationSubscriber,
    JobStore, StoreError, StoreResult, CANCEL_CHANNEL,
};
use crate::models::{Job, JobStatus, NewJob};

/// Job store backed by the `jobs` table
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> StoreResult<Job> {
        let result = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, kind, status, input, cancelled)
            VALUES ($1, $2, 'queued', $3, FALSE)
            RETURNING *
            "#,
        )
        .bind(&job.id)
        .bind(job.kind)
        .bind(&job.input)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateId(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<Value>,
    ) -> StoreResult<Job> {
        if matches!(status, JobStatus::Queued | JobStatus::Cancelled) {
            let current = self.get(id).await?;
            return Err(StoreError::conflict(&current, status));
        }

        // The cancelled/terminal guard lives in the WHERE clause so a cancel
        // committed at any point before this statement wins.
        let updated = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = $2, output = COALESCE($3, output), updated_at = NOW()
            WHERE id = $1
              AND cancelled = FALSE
              AND status IN ('queued', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(output)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => {
                let current = self.get(id).await?;
                Err(StoreError::conflict(&current, status))
            }
        }
    }

    async fn set_cancelled(&self, id: &str) -> StoreResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET cancelled = TRUE, status = 'cancelled', updated_at = NOW()
            WHERE id = $1
              AND cancelled = FALSE
              AND status IN ('queued', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if flipped.is_some() {
            // NOTIFY is delivered on commit, after the flag is visible
            let payload = serde_json::to_string(&CancellationEvent { id: id.to_string() })?;
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(CANCEL_CHANNEL)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            info!(job_id = %id, "Job cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        match current {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(job) if job.cancelled => {
                debug!(job_id = %id, "Cancel requested for already cancelled job");
                Ok(CancelOutcome::AlreadyCancelled)
            }
            Some(job) => {
                debug!(job_id = %id, status = %job.status, "Cancel requested for finished job");
                Ok(CancelOutcome::AlreadyFinished(job.status))
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        health_check(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CancellationSubscriber for PgJobStore {
    async fn subscribe(&self) -> StoreResult<CancellationStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CANCEL_CHANNEL).await?;
        info!(channel = CANCEL_CHANNEL, "Listening for cancellation events");

        let stream = listener.into_stream().map(|notification| -> StoreResult<CancellationEvent> {
            let notification = notification?;
            let event = serde_json::from_str::<CancellationEvent>(notification.payload())?;
            Ok(event)
        });

        Ok(stream.boxed())
    }
}
