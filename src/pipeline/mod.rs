pub mod chunking;
pub mod context;
pub mod decision;
pub mod progress;
pub mod prompts;
pub mod reconcile;
pub mod single_shot;

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::models::Flow;
use crate::operations::{Operation, ValidationReport};

pub use chunking::{ChunkDelay, ChunkingProcessor};
pub use decision::{explain, DecisionEngine, DecisionSummary, ProcessingDecision};
pub use progress::{
    CancellationFlag, ProgressEvent, ProgressSink, ScaledProgress, Stage, TracingProgress,
};
pub use single_shot::SingleShotProcessor;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub bookmarks_processed: usize,
    pub operations_generated: usize,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub folders_created: usize,
}

/// Operations proposed by either processor, plus what was learned on the way.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutcome {
    pub flow: Flow,
    pub operations: Vec<Operation>,
    pub warnings: Vec<String>,
    pub metadata: Option<Value>,
    pub validation: Option<ValidationReport>,
    pub stats: ProcessingStats,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}
