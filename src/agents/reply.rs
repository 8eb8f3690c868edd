//! Reply Agent
//!
//! Default [`TaskExecutor`]: sends the conversation to the configured chat
//! completions endpoint and returns the reply as the job output.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ConversationState, ExecutionOutcome, ExecutorError, TaskExecutor};
use crate::config::LLMConfig;
use crate::llm::provider::LLM;
use crate::types::{LLMRequest, LLMResponse};

const SYSTEM_PROMPT: &str = "You are a knowledgeable research assistant. Provide clear, accurate, and helpful responses based on the conversation so far.";

pub struct ReplyAgent {
    llm: Option<LLM>,
    model: String,
    max_tokens: u32,
}

impl ReplyAgent {
    pub fn new(config: &LLMConfig) -> Self {
        Self {
            llm: LLM::from_config(config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    pub fn with_llm(llm: LLM, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            llm: Some(llm),
            model: model.into(),
            max_tokens,
        }
    }

    fn build_request(&self, state: &ConversationState) -> LLMRequest {
        let mut messages = state.messages.clone();
        if !messages.iter().any(|m| m.role == crate::types::Role::System) {
            messages.insert(0, crate::types::LLMMessage::system(SYSTEM_PROMPT));
        }

        LLMRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(self.max_tokens),
            temperature: Some(0.7),
        }
    }

    fn completed(response: LLMResponse) -> ExecutionOutcome {
        ExecutionOutcome::Completed(json!({
            "text": response.content,
            "finish_reason": response.finish_reason,
            "usage": response.usage,
        }))
    }

    /// Simple fallback response when LLM is not available
    pub fn simple_response(state: &ConversationState) -> String {
        match state.last_user_message() {
            Some(message) => format!(
                "I received your message: \"{}\"\n\n\
                To provide a full answer, please ensure an LLM API key is configured.",
                message
            ),
            None => "Tool result received. Configure an LLM API key to continue the conversation."
                .to_string(),
        }
    }
}

#[async_trait]
impl TaskExecutor for ReplyAgent {
    async fn execute(
        &self,
        state: ConversationState,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        if cancel.is_cancelled() {
            return Ok(ExecutionOutcome::Aborted);
        }

        info!(
            job_id = %state.job_id,
            kind = %state.kind,
            message_count = state.messages.len(),
            "Generating reply"
        );

        let Some(llm) = &self.llm else {
            warn!("No LLM API key configured, using simple response");
            return Ok(ExecutionOutcome::Completed(json!({
                "text": Self::simple_response(&state),
                "finish_reason": "stop",
            })));
        };

        let request = self.build_request(&state);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job_id = %state.job_id, "Reply generation aborted");
                Ok(ExecutionOutcome::Aborted)
            }
            response = llm.create_chat_completion(&request) => {
                let response = response.map_err(|e| ExecutorError::Llm(e.to_string()))?;
                info!(
                    job_id = %state.job_id,
                    response_len = response.content.len(),
                    total_tokens = response.usage.total_tokens,
                    "Generated reply successfully"
                );
                Ok(Self::completed(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::LLMAdapter;
    use crate::models::JobKind;
    use crate::types::{AppError, AppResult, LLMMessage, TokenUsage};
    use std::time::Duration;

    struct SlowAdapter {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl LLMAdapter for SlowAdapter {
        async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AppError::LLMApi("rate limited".to_string()));
            }
            Ok(LLMResponse {
                content: format!("{} messages", request.messages.len()),
                finish_reason: "stop".to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    fn agent(delay: Duration, fail: bool) -> ReplyAgent {
        ReplyAgent::with_llm(
            LLM::with_adapter(Box::new(SlowAdapter { delay, fail })),
            "test-model",
            256,
        )
    }

    fn state() -> ConversationState {
        ConversationState {
            job_id: "job-1".to_string(),
            kind: JobKind::Message,
            conversation_id: None,
            user_id: None,
            messages: vec![LLMMessage::user("hello")],
        }
    }

    #[tokio::test]
    async fn test_reply_includes_default_system_prompt() {
        let outcome = agent(Duration::ZERO, false)
            .execute(state(), CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Completed(output) => assert_eq!(output["text"], "2 messages"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_llm_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = agent(Duration::from_secs(30), false)
            .execute(state(), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_llm_error_is_execution_error() {
        let err = agent(Duration::ZERO, true)
            .execute(state(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Llm(_)));
    }

    #[tokio::test]
    async fn test_simple_response_without_api_key() {
        let agent = ReplyAgent::new(&LLMConfig {
            api_key: None,
            base_url: "http://localhost".to_string(),
            model: "m".to_string(),
            max_tokens: 16,
        });
        let outcome = agent.execute(state(), CancellationToken::new()).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed(output) => {
                assert!(output["text"].as_str().unwrap().contains("hello"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
