use crate::bookmarks::StoreError;
use crate::llm::ApiError;
use crate::models::Flow;

/// Failures that abort a pipeline stage. Per-operation execution failures and
/// per-batch chunk failures are recorded in results instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Model response is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("AI response validation failed: {}", .errors.join(", "))]
    InvalidResponse { errors: Vec<String> },

    #[error("Processing decision invalid: {}", .0.join("; "))]
    DecisionRejected(Vec<String>),

    #[error("Flow {0} cannot be processed by this pipeline")]
    UnsupportedFlow(Flow),

    #[error("No operations generated; the bookmarks may already be organized")]
    NoOperations,

    #[error("All operations failed validation; nothing to apply")]
    AllOperationsInvalid,

    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

impl PipelineError {
    /// User-facing hint for provider failures, keyed by error category.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            PipelineError::Api(err) => err.category().hint(),
            PipelineError::UnknownModel(_) => Some("Choose one of the registered models."),
            _ => None,
        }
    }
}
