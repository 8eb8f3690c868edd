//! Job Store
//!
//! Durable job records plus the cancellation channel that fires on the
//! false→true edge of a job's `cancelled` flag. Two backends:
//!
//! - [`PgJobStore`] - Postgres via sqlx, cancellation over LISTEN/NOTIFY
//! - [`MemoryJobStore`] - in-process, used by tests and the `dev` command

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::models::{Job, JobStatus, NewJob};

pub mod memory;
pub mod pool;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use pool::*;
pub use postgres::PgJobStore;

/// Postgres NOTIFY channel carrying [`CancellationEvent`] payloads
pub const CANCEL_CHANNEL: &str = "job_cancelled";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    DuplicateId(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {id} ({current}, cancelled={cancelled}) cannot move to {attempted}")]
    Conflict {
        id: String,
        current: JobStatus,
        cancelled: bool,
        attempted: JobStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn conflict(job: &Job, attempted: JobStatus) -> Self {
        StoreError::Conflict {
            id: job.id.clone(),
            current: job.status,
            cancelled: job.cancelled,
            attempted,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a cancel request against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag flipped and a cancellation event was published
    Cancelled,
    /// Flag was already set, nothing published
    AlreadyCancelled,
    /// Job had already completed or failed, nothing changed
    AlreadyFinished(JobStatus),
}

/// Payload published on the cancellation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationEvent {
    pub id: String,
}

pub type CancellationStream = BoxStream<'static, StoreResult<CancellationEvent>>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh `queued` job. Fails with `DuplicateId` on id reuse.
    async fn insert(&self, job: NewJob) -> StoreResult<Job>;

    async fn get(&self, id: &str) -> StoreResult<Job>;

    /// Single conditional write, advances `updated_at`.
    ///
    /// Rejected with `Conflict` when the job is cancelled, already terminal,
    /// or `status` is not a worker-writable transition.
    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<Value>,
    ) -> StoreResult<Job>;

    /// Flip the sticky `cancelled` flag. Publishes exactly once, on the edge.
    async fn set_cancelled(&self, id: &str) -> StoreResult<CancelOutcome>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Standing subscription to the cancellation channel
#[async_trait]
pub trait CancellationSubscriber: Send + Sync {
    async fn subscribe(&self) -> StoreResult<CancellationStream>;
}

pub async fn create_pool(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect(config.require_url()?)
        .await?;

    // Test connection
    sqlx::query("SELECT 1")
        .fetch_one(&pool)
        .await?;

    Ok(pool)
}
