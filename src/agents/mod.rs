//! Task Executor boundary
//!
//! Workers hand each job to a [`TaskExecutor`] as a [`ConversationState`]
//! assembled from the job's input, together with a cancellation token the
//! executor must check at its own suspension points.
//!
//! ```text
//! Job.input ──(by kind)──▶ ConversationState ──▶ TaskExecutor::execute
//!                                                   │
//!                           ┌───────────────────────┴──────────┐
//!                           ▼                                  ▼
//!                  Completed(output)                    Aborted (token fired)
//! ```

pub mod reply;
#[cfg(test)]
pub mod testing;

pub use reply::ReplyAgent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Job, JobInput, JobKind};
use crate::types::LLMMessage;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    /// Structured error stored as the job's output
    pub fn to_output(&self) -> Value {
        let kind = match self {
            ExecutorError::InvalidInput(_) => "invalid_input",
            ExecutorError::Llm(_) => "llm",
            ExecutorError::Other(_) => "execution",
        };
        serde_json::json!({ "error": self.to_string(), "kind": kind })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Result stored verbatim as the job's output
    Completed(Value),
    /// The executor observed its cancellation token and stopped
    Aborted,
}

/// Everything the executor needs to continue a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub job_id: String,
    pub kind: JobKind,
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<String>,
    /// Ordered chat transcript, newest last
    pub messages: Vec<LLMMessage>,
}

impl ConversationState {
    pub fn from_job(job: &Job) -> Result<Self, ExecutorError> {
        let input = JobInput::parse(job.kind, job.input.clone())
            .map_err(|e| ExecutorError::InvalidInput(e.to_string()))?;

        let state = match input {
            JobInput::Message(m) => {
                let mut messages = Vec::with_capacity(m.history.len() + 2);
                if let Some(instruction) = m.system_instruction {
                    messages.push(LLMMessage::system(instruction));
                }
                messages.extend(m.history);
                messages.push(LLMMessage::user(m.message));

                Self {
                    job_id: job.id.clone(),
                    kind: JobKind::Message,
                    conversation_id: m.conversation_id,
                    user_id: m.user_id,
                    messages,
                }
            }
            JobInput::Tool(t) => {
                let content = match t.result {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let mut messages = t.history;
                messages.push(LLMMessage::tool(t.tool_call_id, t.tool_name, content));

                Self {
                    job_id: job.id.clone(),
                    kind: JobKind::Tool,
                    conversation_id: t.conversation_id,
                    user_id: t.user_id,
                    messages,
                }
            }
        };

        Ok(state)
    }

    /// Latest user utterance, if any
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::User)
            .map(|m| m.content.as_str())
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task. Implementations must return `Ok(Aborted)` promptly once
    /// `cancel` fires.
    async fn execute(
        &self,
        state: ConversationState,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}
