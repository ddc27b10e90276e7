use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::bookmarks::{BookmarkNode, SharedBookmarkStore};
use crate::error::PipelineError;
use crate::llm::{RetryPolicy, SharedModelApi};
use crate::models::{Flow, ModelRegistry};
use crate::operations::{
    DryRunReport, ExecutionResult, Operation, OperationExecutor, Phase, PhaseProgress,
};
use crate::pipeline::{
    explain, CancellationFlag, ChunkDelay, ChunkingProcessor, DecisionEngine, DecisionSummary,
    ProcessingDecision, ProcessingOutcome, ProgressEvent, ProgressSink, ScaledProgress,
    SingleShotProcessor, Stage,
};

const PROCESSING_BAND: (f64, f64) = (20.0, 80.0);
const VALIDATION_PROGRESS: f64 = 80.0;
const APPLY_BAND: (f64, f64) = (85.0, 100.0);

/// Hex blake3 digest of the tree's JSON form. Used to detect drift between
/// planning and applying.
pub fn tree_fingerprint(tree: &[BookmarkNode]) -> Result<String, PipelineError> {
    let bytes = serde_json::to_vec(tree).map_err(PipelineError::Serialization)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// A plan written by `plan` and consumed by `apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub flow: Flow,
    pub tree_fingerprint: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PlanDocument {
    pub fn from_run(run: PlannedRun) -> Self {
        Self {
            created_at: Utc::now(),
            model: run.decision.model,
            flow: run.outcome.flow,
            tree_fingerprint: run.tree_fingerprint,
            operations: run.outcome.operations,
            warnings: run.outcome.warnings,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid plan file {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize plan")?;
        fs::write(path, json).with_context(|| format!("Failed to write plan {}", path.display()))
    }

    /// True when `tree` still matches the tree the plan was made from.
    pub fn matches(&self, tree: &[BookmarkNode]) -> Result<bool, PipelineError> {
        Ok(tree_fingerprint(tree)? == self.tree_fingerprint)
    }
}

/// A processed plan together with the decision that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedRun {
    pub decision: ProcessingDecision,
    pub outcome: ProcessingOutcome,
    pub tree_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub dry_run: DryRunReport,
    /// `None` when only the dry run was requested.
    pub execution: Option<ExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub decision: DecisionSummary,
    pub operations: usize,
    pub warnings: Vec<String>,
    pub apply: ApplyReport,
}

/// Drives one run against a store: decide, process, dry-run, apply.
pub struct Organizer {
    engine: DecisionEngine,
    api: SharedModelApi,
    store: SharedBookmarkStore,
    retry: RetryPolicy,
    chunk_delay: ChunkDelay,
    cancel: CancellationFlag,
    force_flow: Option<Flow>,
}

impl Organizer {
    pub fn new(registry: Arc<ModelRegistry>, api: SharedModelApi, store: SharedBookmarkStore) -> Self {
        Self {
            engine: DecisionEngine::new(registry),
            api,
            store,
            retry: RetryPolicy::default(),
            chunk_delay: ChunkDelay::default(),
            cancel: CancellationFlag::default(),
            force_flow: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_delay(mut self, delay: ChunkDelay) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_flow(mut self, flow: Option<Flow>) -> Self {
        self.force_flow = flow;
        self
    }

    /// Decide how the current tree would be processed without calling the model.
    pub async fn analyze(&self, model: &str) -> Result<ProcessingDecision, PipelineError> {
        let tree = self.store.get_tree().await?;
        self.engine.decide_with(&tree, model, self.force_flow)
    }

    #[instrument(skip_all, fields(model = model))]
    pub async fn plan(
        &self,
        model: &str,
        progress: &dyn ProgressSink,
    ) -> Result<PlannedRun, PipelineError> {
        progress.report(ProgressEvent::new(Stage::Analyzing, 0.0, "Analyzing bookmarks..."));
        let tree = self.store.get_tree().await?;
        let decision = self.engine.decide_with(&tree, model, self.force_flow)?;
        self.engine.validate(&decision).into_result()?;
        info!(decision = %explain(&decision), "Decision accepted");
        progress.report(ProgressEvent::new(
            Stage::Analyzing,
            10.0,
            format!("Using {} processing", decision.flow),
        ));

        let scaled = ScaledProgress::new(progress, PROCESSING_BAND.0, PROCESSING_BAND.1);
        let outcome = match decision.flow {
            Flow::SingleShot => {
                SingleShotProcessor::new(self.api.clone(), self.retry.clone())
                    .process(&tree, model, &scaled)
                    .await?
            }
            Flow::Chunked => {
                ChunkingProcessor::new(
                    self.api.clone(),
                    self.retry.clone(),
                    self.engine.registry().thresholds.chunk_size,
                )
                .with_delay(self.chunk_delay.clone())
                .with_cancellation(self.cancel.clone())
                .process(&tree, model, &scaled)
                .await?
            }
            Flow::Unsupported => return Err(PipelineError::UnsupportedFlow(decision.flow)),
        };

        if outcome.operations.is_empty() {
            return Err(PipelineError::NoOperations);
        }
        for warning in &outcome.warnings {
            warn!(%warning, "Plan warning");
        }

        Ok(PlannedRun {
            tree_fingerprint: tree_fingerprint(&tree)?,
            decision,
            outcome,
        })
    }

    /// Dry-run `operations` against the store, drop the ones that cannot apply,
    /// and apply the rest unless `dry_run` is set.
    #[instrument(skip_all, fields(operations = operations.len(), dry_run = dry_run))]
    pub async fn apply(
        &self,
        operations: Vec<Operation>,
        dry_run: bool,
        progress: &dyn ProgressSink,
    ) -> Result<ApplyReport, PipelineError> {
        progress.report(ProgressEvent::new(
            Stage::Validating,
            VALIDATION_PROGRESS,
            "Validating operations...",
        ));
        let executor = OperationExecutor::new(self.store.clone()).with_cancellation(self.cancel.clone());
        let report = executor.dry_run(&operations).await;
        for finding in &report.warnings {
            warn!(index = finding.index, message = %finding.message, "Dry-run warning");
        }

        let valid = report.retain_valid(operations);
        if valid.is_empty() {
            return Err(PipelineError::AllOperationsInvalid);
        }
        if report.invalid > 0 {
            warn!(invalid = report.invalid, "Skipping operations that failed the dry run");
        }

        if dry_run {
            progress.report(ProgressEvent::new(Stage::Complete, 100.0, "Dry run complete"));
            return Ok(ApplyReport {
                dry_run: report,
                execution: None,
            });
        }

        let on_phase = |step: PhaseProgress| {
            progress.report(ProgressEvent::new(
                Stage::Applying,
                apply_progress(step),
                format!("Applying {} ({}/{})", step.phase, step.current, step.total),
            ));
        };
        let execution = executor.execute(&valid, &on_phase).await;
        if execution.cancelled {
            return Err(PipelineError::Cancelled);
        }

        progress.report(ProgressEvent::new(
            Stage::Complete,
            100.0,
            format!(
                "Reorganization complete: {} succeeded, {} failed",
                execution.successful, execution.failed
            ),
        ));
        Ok(ApplyReport {
            dry_run: report,
            execution: Some(execution),
        })
    }

    /// Plan and apply in one go.
    pub async fn run(
        &self,
        model: &str,
        dry_run: bool,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport, PipelineError> {
        let planned = self.plan(model, progress).await?;
        let operations = planned.outcome.operations.len();
        let apply = self
            .apply(planned.outcome.operations, dry_run, progress)
            .await?;

        Ok(RunReport {
            decision: DecisionSummary::from(&planned.decision),
            operations,
            warnings: planned.outcome.warnings,
            apply,
        })
    }
}

/// Map executor progress onto the apply band, weighting each phase.
fn apply_progress(step: PhaseProgress) -> f64 {
    let done: f64 = Phase::ORDER
        .iter()
        .take_while(|phase| **phase != step.phase)
        .map(|phase| phase.weight())
        .sum();
    let within = if step.total == 0 {
        1.0
    } else {
        step.current as f64 / step.total as f64
    };
    APPLY_BAND.0 + (APPLY_BAND.1 - APPLY_BAND.0) * (done + step.phase.weight() * within)
}
