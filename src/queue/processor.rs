//! Per-reference processing shared by the worker and the batch consumer.
//!
//! ```text
//! load ─┬─ missing ────────────────────────────▶ SkippedMissing
//!       ├─ cancelled ──────────────────────────▶ SkippedCancelled
//!       ├─ completed/failed ───────────────────▶ SkippedFinished
//!       └─ register ─▶ mark processing ─▶ execute ─┬─▶ Completed
//!                                                  ├─▶ Failed / Deferred
//!                                                  └─▶ Aborted
//! ```
//!
//! Once a cancellation is observed for a job, nothing here writes
//! `completed` or `failed` for it. The store's guarded update backs this up
//! for the cases this process cannot see (a cancel landing between the
//! executor returning and the final write).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::RunningJobRegistry;
use crate::agents::{ConversationState, ExecutionOutcome, ExecutorError, TaskExecutor};
use crate::db::{JobStore, StoreError, StoreResult};
use crate::models::{Job, JobStatus};

/// What happened to one queue reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed,
    Aborted,
    SkippedMissing,
    SkippedCancelled,
    SkippedFinished,
    /// Executor error left unrecorded so the queue redelivers the item
    Deferred(String),
}

/// How an executor error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Write `failed` with the error as output
    Record,
    /// Leave the row untouched and report the failure to the caller
    Defer,
}

enum Executed {
    Completed(serde_json::Value),
    Failed(ExecutorError),
    Aborted,
    TimedOut(Duration),
}

#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn TaskExecutor>,
    abort_grace: Duration,
    job_timeout: Option<Duration>,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn JobStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            store,
            executor,
            abort_grace: Duration::from_secs(5),
            job_timeout: None,
        }
    }

    /// Time an aborted executor gets to return before it is dropped
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Process one job reference.
    ///
    /// With a registry, the job's abort token is registered under its id for
    /// the duration of the execution. `Err` is returned only for store
    /// failures; the caller must not acknowledge the message in that case.
    pub async fn process(
        &self,
        id: &str,
        registry: Option<&RunningJobRegistry>,
        policy: FailurePolicy,
    ) -> StoreResult<Disposition> {
        let job = match self.store.get(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %id, "Job not found, dropping reference");
                return Ok(Disposition::SkippedMissing);
            }
            Err(e) => return Err(e),
        };

        if job.cancelled {
            info!(job_id = %id, "Job cancelled before execution, skipping");
            return Ok(Disposition::SkippedCancelled);
        }
        if job.status.is_terminal() {
            info!(job_id = %id, status = %job.status, "Job already finished, skipping redelivery");
            return Ok(Disposition::SkippedFinished);
        }

        // Registered before the processing write: a cancel that commits after
        // this point reaches the token, one that commits before it makes the
        // write below fail.
        let registration = registry.map(|r| r.register(id));
        let abort = registration
            .as_ref()
            .map(|r| r.token().clone())
            .unwrap_or_default();

        match self.store.update_status(id, JobStatus::Processing, None).await {
            Ok(_) => {}
            Err(StoreError::Conflict { cancelled: true, .. }) => {
                info!(job_id = %id, "Job cancelled while loading, skipping");
                return Ok(Disposition::SkippedCancelled);
            }
            Err(StoreError::Conflict { .. }) => return Ok(Disposition::SkippedFinished),
            Err(StoreError::NotFound(_)) => return Ok(Disposition::SkippedMissing),
            Err(e) => return Err(e),
        }

        info!(job_id = %id, kind = %job.kind, "Executing job");

        let executed = self.run_executor(&job, &abort).await;
        drop(registration);

        match executed {
            Executed::Completed(output) => {
                self.finish(id, JobStatus::Completed, output).await
            }
            Executed::Aborted => {
                info!(job_id = %id, "Job aborted by cancellation");
                Ok(Disposition::Aborted)
            }
            Executed::Failed(err) => match policy {
                FailurePolicy::Record => {
                    warn!(job_id = %id, error = %err, "Job execution failed");
                    self.finish(id, JobStatus::Failed, err.to_output()).await
                }
                FailurePolicy::Defer => {
                    warn!(job_id = %id, error = %err, "Job execution failed, deferring to redelivery");
                    Ok(Disposition::Deferred(err.to_string()))
                }
            },
            Executed::TimedOut(limit) => {
                warn!(job_id = %id, timeout_secs = limit.as_secs(), "Job timed out");
                let output = json!({
                    "error": format!("job exceeded execution timeout of {}s", limit.as_secs()),
                    "kind": "timeout",
                });
                self.finish(id, JobStatus::Failed, output).await
            }
        }
    }

    async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        output: serde_json::Value,
    ) -> StoreResult<Disposition> {
        match self.store.update_status(id, status, Some(output)).await {
            Ok(_) => {
                info!(job_id = %id, status = %status, "Job finished");
                Ok(match status {
                    JobStatus::Completed => Disposition::Completed,
                    _ => Disposition::Failed,
                })
            }
            Err(StoreError::Conflict { cancelled: true, .. }) => {
                info!(job_id = %id, "Job was cancelled during execution, discarding result");
                Ok(Disposition::Aborted)
            }
            Err(StoreError::Conflict { current, .. }) => {
                debug!(job_id = %id, current = %current, "Job finished elsewhere, discarding result");
                Ok(Disposition::SkippedFinished)
            }
            Err(StoreError::NotFound(_)) => Ok(Disposition::SkippedMissing),
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to persist job outcome");
                Err(e)
            }
        }
    }

    async fn run_executor(&self, job: &Job, abort: &CancellationToken) -> Executed {
        let state = match ConversationState::from_job(job) {
            Ok(state) => state,
            Err(e) => return Executed::Failed(e),
        };

        let exec_token = abort.child_token();
        let execution = self.executor.execute(state, exec_token.clone());
        tokio::pin!(execution);

        let timeout = async {
            match self.job_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let mut timed_out = false;
        tokio::select! {
            result = &mut execution => {
                return Self::classify(result, abort.is_cancelled(), None);
            }
            _ = abort.cancelled() => {}
            _ = &mut timeout => {
                timed_out = true;
                exec_token.cancel();
            }
        }

        let limit = self.job_timeout.filter(|_| timed_out);
        match tokio::time::timeout(self.abort_grace, &mut execution).await {
            Ok(result) => Self::classify(result, abort.is_cancelled(), limit),
            Err(_) => {
                warn!(
                    job_id = %job.id,
                    grace_secs = self.abort_grace.as_secs(),
                    "Executor ignored cancellation, dropping execution"
                );
                match limit {
                    Some(limit) if !abort.is_cancelled() => Executed::TimedOut(limit),
                    _ => Executed::Aborted,
                }
            }
        }
    }

    fn classify(
        result: Result<ExecutionOutcome, ExecutorError>,
        aborted: bool,
        timed_out: Option<Duration>,
    ) -> Executed {
        if aborted {
            return Executed::Aborted;
        }
        match (result, timed_out) {
            (Ok(ExecutionOutcome::Completed(output)), _) => Executed::Completed(output),
            (_, Some(limit)) => Executed::TimedOut(limit),
            (Ok(ExecutionOutcome::Aborted), None) => Executed::Failed(ExecutorError::Other(
                "executor aborted without a cancellation request".to_string(),
            )),
            (Err(e), None) => Executed::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedExecutor;
    use crate::db::MemoryJobStore;
    use crate::models::{JobKind, NewJob};
    use async_trait::async_trait;
    use serde_json::Value;

    async fn insert(store: &MemoryJobStore, message: &str) -> String {
        store
            .insert(NewJob::new(JobKind::Message, json!({ "message": message })))
            .await
            .unwrap()
            .id
    }

    fn processor(store: &MemoryJobStore, executor: impl TaskExecutor + 'static) -> JobProcessor {
        JobProcessor::new(Arc::new(store.clone()), Arc::new(executor))
    }

    #[tokio::test]
    async fn test_executor_error_recorded_as_failed() {
        let store = MemoryJobStore::new();
        let id = insert(&store, "fail").await;

        let disposition = processor(&store, ScriptedExecutor::immediate())
            .process(&id, None, FailurePolicy::Record)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Failed);

        let row = store.get(&id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.output.unwrap()["error"], "scripted failure");
    }

    #[tokio::test]
    async fn test_deferred_failure_leaves_row_processing() {
        let store = MemoryJobStore::new();
        let id = insert(&store, "fail").await;

        let disposition = processor(&store, ScriptedExecutor::immediate())
            .process(&id, None, FailurePolicy::Defer)
            .await
            .unwrap();
        assert!(matches!(disposition, Disposition::Deferred(_)));

        let row = store.get(&id).await.unwrap();
        assert_eq!(row.status, JobStatus::Processing);
        assert!(row.output.is_none());
    }

    #[tokio::test]
    async fn test_invalid_stored_input_fails_job() {
        let store = MemoryJobStore::new();
        let id = store
            .insert(NewJob::new(JobKind::Tool, json!({ "unexpected": true })))
            .await
            .unwrap()
            .id;

        let executor = ScriptedExecutor::immediate();
        let disposition = processor(&store, executor.clone())
            .process(&id, None, FailurePolicy::Record)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(executor.calls(), 0);
        assert_eq!(store.get(&id).await.unwrap().output.unwrap()["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_timeout_records_failure() {
        let store = MemoryJobStore::new();
        let id = insert(&store, "slow").await;

        let executor = ScriptedExecutor::new(Duration::from_secs(30));
        let disposition = processor(&store, executor.clone())
            .with_job_timeout(Some(Duration::from_millis(30)))
            .process(&id, None, FailurePolicy::Record)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(executor.aborts(), 1);

        let row = store.get(&id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.output.unwrap()["kind"], "timeout");
    }

    /// Cancels its own job right before returning a result, simulating a
    /// cancel that lands after execution but before the final write.
    struct CancelsLate {
        store: MemoryJobStore,
    }

    #[async_trait]
    impl TaskExecutor for CancelsLate {
        async fn execute(
            &self,
            state: ConversationState,
            _cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, ExecutorError> {
            self.store.set_cancelled(&state.job_id).await.unwrap();
            Ok(ExecutionOutcome::Completed(Value::String("too late".to_string())))
        }
    }

    #[tokio::test]
    async fn test_late_cancel_wins_over_result() {
        let store = MemoryJobStore::new();
        let id = insert(&store, "race").await;

        let disposition = processor(&store, CancelsLate { store: store.clone() })
            .process(&id, None, FailurePolicy::Record)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Aborted);

        let row = store.get(&id).await.unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);
        assert!(row.output.is_none());
    }

    #[tokio::test]
    async fn test_stubborn_executor_dropped_after_grace() {
        let store = MemoryJobStore::new();
        let id = insert(&store, "stubborn").await;
        let registry = RunningJobRegistry::new();

        let executor = ScriptedExecutor::stubborn(Duration::from_secs(30));
        let proc = processor(&store, executor.clone()).with_abort_grace(Duration::from_millis(20));

        let canceller = {
            let store = store.clone();
            let registry = registry.clone();
            let started = executor.started.clone();
            let id = id.clone();
            tokio::spawn(async move {
                started.notified().await;
                store.set_cancelled(&id).await.unwrap();
                assert!(registry.abort(&id));
            })
        };

        let disposition = tokio::time::timeout(
            Duration::from_secs(5),
            proc.process(&id, Some(&registry), FailurePolicy::Record),
        )
        .await
        .expect("stubborn executor should be dropped")
        .unwrap();
        canceller.await.unwrap();

        assert_eq!(disposition, Disposition::Aborted);
        assert!(registry.is_empty());
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Cancelled);
    }
}
