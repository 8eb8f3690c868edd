use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use super::{
    CancelOutcome, CancellationEvent, CancellationStream, CancellationSubscriber, JobStore,
    StoreError, StoreResult,
};
use crate::models::{Job, JobStatus, NewJob};

const EVENT_BUFFER: usize = 256;

/// In-process job store. Each mutation runs under one lock, which gives the
/// same per-row atomicity the Postgres backend gets from single statements.
#[derive(Clone)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    events: broadcast::Sender<CancellationEvent>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        // A poisoned map is still structurally valid
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob) -> StoreResult<Job> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }

        let now = Utc::now();
        let row = Job {
            id: job.id.clone(),
            kind: job.kind,
            status: JobStatus::Queued,
            cancelled: false,
            input: job.input,
            output: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: &str) -> StoreResult<Job> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<Value>,
    ) -> StoreResult<Job> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if job.cancelled || !job.status.can_transition_to(status) {
            return Err(StoreError::conflict(job, status));
        }

        job.status = status;
        if output.is_some() {
            job.output = output;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn set_cancelled(&self, id: &str) -> StoreResult<CancelOutcome> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if job.cancelled {
            return Ok(CancelOutcome::AlreadyCancelled);
        }
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job.status));
        }

        job.cancelled = true;
        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();

        // Sent while the lock is held so the flag is visible before any
        // subscriber can observe the event. No receivers is not an error.
        let _ = self.events.send(CancellationEvent { id: id.to_string() });
        Ok(CancelOutcome::Cancelled)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl CancellationSubscriber for MemoryJobStore {
    async fn subscribe(&self) -> StoreResult<CancellationStream> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Cancellation subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
