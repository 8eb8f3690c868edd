//! Scripted executor for consumer tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{ConversationState, ExecutionOutcome, ExecutorError, TaskExecutor};

/// Echoes the last user message after `delay`. A message of `"fail"`
/// produces an executor error.
#[derive(Clone)]
pub struct ScriptedExecutor {
    pub delay: Duration,
    pub honor_cancel: bool,
    pub calls: Arc<AtomicUsize>,
    pub aborts: Arc<AtomicUsize>,
    pub started: Arc<Notify>,
}

impl ScriptedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            honor_cancel: true,
            calls: Arc::new(AtomicUsize::new(0)),
            aborts: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Notify::new()),
        }
    }

    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Never looks at its cancellation token
    pub fn stubborn(delay: Duration) -> Self {
        Self {
            honor_cancel: false,
            ..Self::new(delay)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn expected_output(message: &str) -> serde_json::Value {
        json!({ "echo": message })
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        state: ConversationState,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if self.honor_cancel {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.aborts.fetch_add(1, Ordering::SeqCst);
                    return Ok(ExecutionOutcome::Aborted);
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        } else {
            tokio::time::sleep(self.delay).await;
        }

        let message = state.last_user_message().unwrap_or_default().to_string();
        if message == "fail" {
            return Err(ExecutorError::Other("scripted failure".to_string()));
        }
        Ok(ExecutionOutcome::Completed(Self::expected_output(&message)))
    }
}
