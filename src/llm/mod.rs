pub mod client;
pub mod error;
#[cfg(test)]
pub mod mock;
pub mod openai;
pub mod retry;

pub use client::{ChatMessage, CompletionOptions, SharedModelApi};
pub use error::ApiError;
pub use openai::OpenAiGateway;
pub use retry::{with_api_retry, RetryPolicy};
