use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::bookmarks::BookmarkNode;
use crate::error::PipelineError;
use crate::metrics::{can_use_single_shot, compute_metrics, Metrics};
use crate::models::{Flow, ModelRegistry, ModelSpec, Tier};

const OUTPUT_TOKENS_PER_BOOKMARK: f64 = 10.0;
const SECONDS_PER_CHUNK: u64 = 5;
const SECONDS_BETWEEN_CHUNKS: u64 = 2;
const LARGE_COLLECTION: u64 = 5_000;
const CONTEXT_WARNING_RATIO: f64 = 0.8;

/// Immutable per-run choice of flow, with its estimates and the reasons for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingDecision {
    pub flow: Flow,
    pub tier: Tier,
    pub model: String,
    pub metrics: Metrics,
    pub estimated_cost: Option<f64>,
    pub estimated_time: Option<String>,
    pub num_chunks: Option<usize>,
    pub reasoning: Vec<String>,
    pub warnings: Vec<String>,
}

/// Caller-facing projection of a decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSummary {
    pub flow: Flow,
    pub tier: Tier,
    pub estimated_cost: Option<f64>,
    pub estimated_time: Option<String>,
    pub bookmark_count: u64,
    pub reasoning: Vec<String>,
    pub warnings: Vec<String>,
}

impl From<&ProcessingDecision> for DecisionSummary {
    fn from(decision: &ProcessingDecision) -> Self {
        Self {
            flow: decision.flow,
            tier: decision.tier,
            estimated_cost: decision.estimated_cost,
            estimated_time: decision.estimated_time.clone(),
            bookmark_count: decision.metrics.bookmark_count,
            reasoning: decision.reasoning.clone(),
            warnings: decision.warnings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionValidation {
    pub valid: bool,
    pub can_proceed: bool,
    pub errors: Vec<String>,
}

impl DecisionValidation {
    pub fn into_result(self) -> Result<(), PipelineError> {
        if self.valid && self.can_proceed {
            Ok(())
        } else {
            Err(PipelineError::DecisionRejected(self.errors))
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    registry: Arc<ModelRegistry>,
}

impl DecisionEngine {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn decide(
        &self,
        tree: &[BookmarkNode],
        model_id: &str,
    ) -> Result<ProcessingDecision, PipelineError> {
        self.decide_with(tree, model_id, None)
    }

    #[instrument(skip_all, fields(model = model_id))]
    pub fn decide_with(
        &self,
        tree: &[BookmarkNode],
        model_id: &str,
        force_flow: Option<Flow>,
    ) -> Result<ProcessingDecision, PipelineError> {
        let model = self.registry.require(model_id)?;
        let metrics = compute_metrics(tree, &self.registry)?;

        let mut decision = ProcessingDecision {
            flow: Flow::Unsupported,
            tier: metrics.tier,
            model: model_id.to_string(),
            metrics,
            estimated_cost: None,
            estimated_time: None,
            num_chunks: None,
            reasoning: Vec::new(),
            warnings: Vec::new(),
        };

        // Terminal tiers stop here; a forced flow cannot override them.
        if decision.tier.is_terminal() {
            decision
                .reasoning
                .push("Dataset exceeds supported limits (T4 tier)".to_string());
            decision.warnings.push(
                "This collection is too large to reorganize; split it before retrying.".to_string(),
            );
            if force_flow.is_some_and(|forced| forced != Flow::Unsupported) {
                warn!(tier = %decision.tier, "Ignoring flow override for an unsupported collection");
            }
            info!(tier = %decision.tier, bookmarks = decision.metrics.bookmark_count, "Collection unsupported");
            return Ok(decision);
        }

        if can_use_single_shot(&decision.metrics, model, &self.registry.thresholds) {
            self.plan_single_shot(&mut decision, model);
        } else {
            self.plan_chunked(&mut decision, model);
        }

        if decision.metrics.bookmark_count > LARGE_COLLECTION {
            decision
                .warnings
                .push("Large dataset may take several minutes to process".to_string());
        }
        if decision.metrics.estimated_tokens as f64
            > model.context_window as f64 * CONTEXT_WARNING_RATIO
        {
            decision
                .warnings
                .push("Dataset approaching model context limit".to_string());
        }

        if let Some(forced) = force_flow {
            decision.flow = forced;
            decision
                .reasoning
                .push(format!("Flow overridden by user: {forced}"));
            if forced == Flow::Chunked && decision.num_chunks.is_none() {
                decision.num_chunks = Some(self.chunk_count(decision.metrics.bookmark_count));
            }
        }

        info!(
            flow = %decision.flow,
            tier = %decision.tier,
            bookmarks = decision.metrics.bookmark_count,
            "Processing decision made"
        );
        Ok(decision)
    }

    fn plan_single_shot(&self, decision: &mut ProcessingDecision, model: &ModelSpec) {
        let metrics = &decision.metrics;
        decision.flow = Flow::SingleShot;
        decision.reasoning.push(format!(
            "Dataset fits in single request ({} bookmarks, {:.2} KB gzipped)",
            metrics.bookmark_count,
            metrics.gzip_kb()
        ));
        decision.reasoning.push(format!(
            "Model {} has {} token context window",
            decision.model, model.context_window
        ));

        let input_tokens = metrics.estimated_tokens as f64;
        let output_tokens = (metrics.bookmark_count as f64 * OUTPUT_TOKENS_PER_BOOKMARK).ceil();
        decision.estimated_cost = Some(
            input_tokens / 1000.0 * model.cost_per_1k_input
                + output_tokens / 1000.0 * model.cost_per_1k_output,
        );
        decision.estimated_time = Some("30-60 seconds".to_string());
    }

    fn plan_chunked(&self, decision: &mut ProcessingDecision, model: &ModelSpec) {
        let metrics = &decision.metrics;
        let num_chunks = self.chunk_count(metrics.bookmark_count);
        decision.flow = Flow::Chunked;
        decision.num_chunks = Some(num_chunks);
        decision.reasoning.push(format!(
            "Dataset exceeds single-shot thresholds ({} bookmarks)",
            metrics.bookmark_count
        ));
        decision
            .reasoning
            .push("Falling back to chunked processing with global context".to_string());

        let chunks = num_chunks.max(1) as f64;
        let tokens_per_chunk = (metrics.estimated_tokens as f64 / chunks).ceil();
        let output_per_chunk =
            (metrics.bookmark_count as f64 / chunks * OUTPUT_TOKENS_PER_BOOKMARK).ceil();
        decision.estimated_cost = Some(
            chunks
                * (tokens_per_chunk / 1000.0 * model.cost_per_1k_input
                    + output_per_chunk / 1000.0 * model.cost_per_1k_output),
        );

        let seconds = num_chunks as u64 * (SECONDS_PER_CHUNK + SECONDS_BETWEEN_CHUNKS);
        decision.estimated_time = Some(format!("{} minutes", seconds.div_ceil(60)));
    }

    fn chunk_count(&self, bookmark_count: u64) -> usize {
        let chunk_size = self.registry.thresholds.chunk_size.max(1) as u64;
        bookmark_count.div_ceil(chunk_size) as usize
    }

    pub fn validate(&self, decision: &ProcessingDecision) -> DecisionValidation {
        let mut validation = DecisionValidation {
            valid: true,
            can_proceed: true,
            errors: Vec::new(),
        };

        if self.registry.model(&decision.model).is_none() {
            validation.valid = false;
            validation
                .errors
                .push(format!("Unknown model: {}", decision.model));
        }

        if decision.flow == Flow::Unsupported || decision.tier.is_terminal() {
            validation.can_proceed = false;
            validation
                .errors
                .push("Collection exceeds the supported size for reorganization".to_string());
        }

        if decision.metrics.raw_bytes > self.registry.thresholds.max_raw_bytes {
            validation.can_proceed = false;
            validation.errors.push(format!(
                "Dataset exceeds {} MB memory limit",
                self.registry.thresholds.max_raw_bytes / (1024 * 1024)
            ));
        }

        validation
    }
}

/// Multi-line human-readable rendering of a decision.
pub fn explain(decision: &ProcessingDecision) -> String {
    let metrics = &decision.metrics;
    let mut out = String::new();

    let _ = writeln!(out, "Analysis");
    let _ = writeln!(out, "  Bookmarks:        {}", metrics.bookmark_count);
    let _ = writeln!(
        out,
        "  Size:             {:.2} KB ({:.2} KB compressed{})",
        metrics.raw_kb(),
        metrics.gzip_kb(),
        if metrics.compression_estimated { ", estimated" } else { "" }
    );
    let _ = writeln!(out, "  Estimated tokens: {}", metrics.estimated_tokens);
    let _ = writeln!(out, "  Tier:             {}", decision.tier);
    let _ = writeln!(out);
    let _ = writeln!(out, "Selected flow: {}", decision.flow.as_str().to_uppercase());
    if let Some(chunks) = decision.num_chunks {
        let _ = writeln!(out, "  Chunks:           {chunks}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Reasoning");
    for reason in &decision.reasoning {
        let _ = writeln!(out, "  - {reason}");
    }
    let _ = writeln!(out);
    match decision.estimated_cost {
        Some(cost) => {
            let _ = writeln!(out, "Estimated cost: ${cost:.4}");
        }
        None => {
            let _ = writeln!(out, "Estimated cost: n/a");
        }
    }
    let _ = writeln!(
        out,
        "Estimated time: {}",
        decision.estimated_time.as_deref().unwrap_or("n/a")
    );

    if !decision.warnings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Warnings");
        for warning in &decision.warnings {
            let _ = writeln!(out, "  - {warning}");
        }
    }

    out
}
