//! Producer side: submit, cancel and status for jobs

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info};

use super::{JobQueue, QueueReference};
use crate::db::{CancelOutcome, JobStore};
use crate::models::{JobInput, JobKind, JobStatusResponse, NewJob};
use crate::types::AppResult;

pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Validate a raw payload for `kind` and submit it
    pub async fn submit_raw(&self, kind: JobKind, raw: Value) -> AppResult<String> {
        let input = JobInput::parse(kind, raw)?;
        self.submit(&input).await
    }

    /// Insert a `queued` row, then enqueue its reference.
    ///
    /// The two writes are not atomic: if the enqueue fails the row stays
    /// `queued` without a reference and the error is returned.
    pub async fn submit(&self, input: &JobInput) -> AppResult<String> {
        let job = self
            .store
            .insert(NewJob::new(input.kind(), input.to_value()?))
            .await?;

        if let Err(e) = self.queue.enqueue(&QueueReference::new(&job.id)).await {
            error!(job_id = %job.id, error = %e, "Enqueue failed after insert, job left queued");
            return Err(e.into());
        }

        info!(job_id = %job.id, kind = %job.kind, "Job submitted");
        Ok(job.id)
    }

    /// Request cancellation. Finished jobs are left as they are.
    pub async fn cancel(&self, id: &str) -> AppResult<CancelOutcome> {
        let outcome = self.store.set_cancelled(id).await?;
        info!(job_id = %id, ?outcome, "Cancel requested");
        Ok(outcome)
    }

    pub async fn status(&self, id: &str) -> AppResult<JobStatusResponse> {
        let job = self.store.get(id).await?;
        Ok(job.into())
    }
}
