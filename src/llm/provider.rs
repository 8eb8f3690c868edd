use async_trait::async_trait;

use crate::config::LLMConfig;
use crate::llm::openai::OpenAICompatibleAdapter;
use crate::types::{AppResult, LLMRequest, LLMResponse};

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;
}

pub struct LLM {
    adapter: Box<dyn LLMAdapter>,
}

impl LLM {
    /// Build a client for the configured endpoint, `None` without an API key
    pub fn from_config(config: &LLMConfig) -> Option<Self> {
        let api_key = config.active_api_key()?;
        Some(Self::with_adapter(Box::new(OpenAICompatibleAdapter::new(
            &config.base_url,
            api_key,
        ))))
    }

    pub fn with_adapter(adapter: Box<dyn LLMAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.adapter.create_chat_completion(request).await
    }
}
