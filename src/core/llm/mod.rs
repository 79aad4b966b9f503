mod openai;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::store::OpenAiSettings;

pub use openai::OpenAiClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Reply text plus the units the provider billed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_units: i64,
    pub output_units: i64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no api key configured")]
    MissingKey,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response had no choices")]
    EmptyResponse,
}

/// Metered external language model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        settings: &OpenAiSettings,
        messages: &[ChatMessage],
    ) -> Result<Completion, LlmError>;
}
