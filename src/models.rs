use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::config::Config;
use crate::queue::JobService;
use crate::types::{AppError, AppResult, LLMMessage};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub config: Config,
}

/// Job kind, selects the input/output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobKind {
    Message,
    Tool,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Message => "message",
            JobKind::Tool => "tool",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "message" => Some(JobKind::Message),
            "tool" => Some(JobKind::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Transitions a worker may write. `cancelled` is only ever set
    /// through the cancel path, never by a worker status write.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (_, JobStatus::Queued | JobStatus::Cancelled) => false,
            (JobStatus::Queued | JobStatus::Processing, _) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job record as held by the job store
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub cancelled: bool,
    pub input: Value,
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub kind: JobKind,
    pub input: Value,
}

impl NewJob {
    pub fn new(kind: JobKind, input: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            input,
        }
    }
}

/// Input for a fresh user utterance
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MessageJobInput {
    #[validate(length(min = 1, message = "message must not be empty"))]
    pub message: String,
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<String>,
    /// Prior turns of the conversation, oldest first
    #[serde(default)]
    pub history: Vec<LLMMessage>,
    pub system_instruction: Option<String>,
}

/// Input for a tool-call result being fed back to the executor
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ToolJobInput {
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<String>,
    #[validate(length(min = 1, message = "tool_call_id must not be empty"))]
    pub tool_call_id: String,
    #[validate(length(min = 1, message = "tool_name must not be empty"))]
    pub tool_name: String,
    pub result: Value,
    #[serde(default)]
    pub history: Vec<LLMMessage>,
}

#[derive(Debug, Clone)]
pub enum JobInput {
    Message(MessageJobInput),
    Tool(ToolJobInput),
}

impl JobInput {
    /// Parse and validate a raw payload for the given kind
    pub fn parse(kind: JobKind, raw: Value) -> AppResult<Self> {
        let input = match kind {
            JobKind::Message => JobInput::Message(
                serde_json::from_value(raw).map_err(|e| AppError::InvalidRequest(e.to_string()))?,
            ),
            JobKind::Tool => JobInput::Tool(
                serde_json::from_value(raw).map_err(|e| AppError::InvalidRequest(e.to_string()))?,
            ),
        };

        let validation = match &input {
            JobInput::Message(m) => m.validate(),
            JobInput::Tool(t) => t.validate(),
        };
        validation.map_err(|e| AppError::InvalidRequest(e.to_string()))?;

        Ok(input)
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobInput::Message(_) => JobKind::Message,
            JobInput::Tool(_) => JobKind::Tool,
        }
    }

    pub fn to_value(&self) -> AppResult<Value> {
        let value = match self {
            JobInput::Message(m) => serde_json::to_value(m),
            JobInput::Tool(t) => serde_json::to_value(t),
        };
        value.map_err(|e| AppError::Internal(e.to_string()))
    }
}

// API Request/Response types

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub id: String,
    pub status: JobStatus,
    pub output: Option<Value>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            output: job.output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub database: String,
    pub queue: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));

        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn test_parse_message_input() {
        let input = JobInput::parse(
            JobKind::Message,
            json!({ "message": "What does rapamycin do?", "history": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" }
            ]}),
        )
        .unwrap();
        match input {
            JobInput::Message(m) => {
                assert_eq!(m.history.len(), 2);
                assert!(m.conversation_id.is_none());
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_and_empty_fields() {
        let missing = JobInput::parse(JobKind::Message, json!({ "conversation_id": null }));
        assert!(matches!(missing, Err(AppError::InvalidRequest(_))));

        let empty = JobInput::parse(JobKind::Message, json!({ "message": "" }));
        assert!(matches!(empty, Err(AppError::InvalidRequest(_))));

        let no_result = JobInput::parse(
            JobKind::Tool,
            json!({ "tool_call_id": "call_1", "tool_name": "search" }),
        );
        assert!(matches!(no_result, Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn test_kind_from_id() {
        assert_eq!(JobKind::from_id("message"), Some(JobKind::Message));
        assert_eq!(JobKind::from_id("tool"), Some(JobKind::Tool));
        assert_eq!(JobKind::from_id("deep-research"), None);
    }
}
