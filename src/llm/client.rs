use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub json_mode: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            json_mode: true,
            temperature: 0.3,
            max_tokens: 4_000,
        }
    }
}

impl CompletionOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Chat-completion contract plus optional file storage for large payloads.
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Returns the assistant message content of the first choice.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ApiError>;

    fn supports_file_upload(&self) -> bool {
        false
    }

    /// Store a gzip payload and return the provider's file id.
    async fn upload_file(&self, _gzip: Vec<u8>) -> Result<String, ApiError> {
        Err(ApiError::unsupported("File upload"))
    }

    async fn delete_file(&self, _file_id: &str) -> Result<(), ApiError> {
        Err(ApiError::unsupported("File deletion"))
    }
}

pub type SharedModelApi = Arc<dyn ModelApi>;
