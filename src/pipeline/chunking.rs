use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use super::context::GlobalContext;
use super::progress::{CancellationFlag, ProgressEvent, ProgressSink, Stage};
use super::prompts::{chunk_system_prompt, chunk_user_prompt};
use super::reconcile::{reconcile, BatchProposal, Proposal};
use super::{ProcessingOutcome, ProcessingStats};
use crate::bookmarks::{default_root_path, flatten_bookmarks, BookmarkNode, BookmarkRecord};
use crate::error::PipelineError;
use crate::llm::{with_api_retry, ChatMessage, CompletionOptions, RetryPolicy, SharedModelApi};
use crate::models::Flow;
use crate::operations::validator::{parse_response_json, validate_operations};

/// Pause between batches: `base * factor + jitter`, with a shorter factor for
/// the last fifth of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDelay {
    pub base: Duration,
    pub max_jitter: Duration,
    pub tail_factor: f64,
}

impl Default for ChunkDelay {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2_000),
            max_jitter: Duration::from_millis(1_000),
            tail_factor: 0.7,
        }
    }
}

impl ChunkDelay {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max_jitter: Duration::ZERO,
            tail_factor: 1.0,
        }
    }

    pub fn with_base(base: Duration) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// Delay after batch `index` (zero-based) out of `total`.
    pub fn delay_for(&self, index: usize, total: usize) -> Duration {
        let factor = if index as f64 > total as f64 * 0.8 {
            self.tail_factor
        } else {
            1.0
        };
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base.mul_f64(factor) + jitter
    }
}

/// Order-preserving batches of at most `chunk_size` records.
pub fn create_chunks(records: &[BookmarkRecord], chunk_size: usize) -> Vec<&[BookmarkRecord]> {
    records.chunks(chunk_size.max(1)).collect()
}

/// Sends the collection in sequential batches, each one seeing the folders the
/// previous batches proposed, then merges the proposals into one plan.
pub struct ChunkingProcessor {
    api: SharedModelApi,
    retry: RetryPolicy,
    chunk_size: usize,
    delay: ChunkDelay,
    cancel: CancellationFlag,
}

impl ChunkingProcessor {
    pub fn new(api: SharedModelApi, retry: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            api,
            retry,
            chunk_size,
            delay: ChunkDelay::default(),
            cancel: CancellationFlag::default(),
        }
    }

    pub fn with_delay(mut self, delay: ChunkDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[instrument(skip_all, fields(model = model, chunk_size = self.chunk_size))]
    pub async fn process(
        &self,
        tree: &[BookmarkNode],
        model: &str,
        progress: &dyn ProgressSink,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let started = Instant::now();
        progress.report(ProgressEvent::new(
            Stage::Processing,
            0.0,
            "Analyzing bookmark structure...",
        ));

        let mut context = GlobalContext::from_tree(tree);
        let records = flatten_bookmarks(tree);
        let chunks = create_chunks(&records, self.chunk_size);
        let total = chunks.len();
        info!(bookmarks = records.len(), chunks = total, "Starting chunked processing");

        let mut proposal = Proposal::default();
        let mut chunks_failed = 0;
        let mut last_error = None;

        for (index, batch) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(completed = index, total, "Chunked processing cancelled");
                return Err(PipelineError::Cancelled);
            }

            let number = index + 1;
            progress.report(ProgressEvent::new(
                Stage::Processing,
                index as f64 / total as f64 * 100.0,
                format!("Processing chunk {number}/{total}..."),
            ));

            match self.process_batch(&context, number, batch, model).await {
                Ok(batch_proposal) => {
                    debug!(
                        chunk = number,
                        assignments = batch_proposal.assignments.len(),
                        folders = batch_proposal.pending_folders.len(),
                        "Chunk processed"
                    );
                    context = context.with_created_folders(&batch_proposal.pending_folders);
                    proposal.absorb(batch_proposal);
                }
                Err(PipelineError::Api(err)) if !err.recoverable => {
                    warn!(chunk = number, error = %err, "Non-recoverable API error; stopping");
                    return Err(PipelineError::Api(err));
                }
                Err(err) => {
                    warn!(chunk = number, error = %err, "Chunk failed; continuing with the next one");
                    proposal
                        .warnings
                        .push(format!("Chunk {number} failed: {err}"));
                    chunks_failed += 1;
                    last_error = Some(err);
                }
            }

            if number < total {
                let delay = self.delay.delay_for(index, total);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if total > 0 && chunks_failed == total {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        progress.report(ProgressEvent::new(
            Stage::Processing,
            95.0,
            "Reconciling folders...",
        ));
        let reconciled = reconcile(proposal);
        if reconciled.merged > 0 {
            info!(merged = reconciled.merged, "Merged duplicate folder proposals");
        }
        let mut plan = reconciled.finalize(&context.existing_handles(), &default_root_path(tree));
        let report = validate_operations(&plan.operations, &records).into_result()?;
        plan.warnings.extend(report.warnings.iter().cloned());

        progress.report(ProgressEvent::new(Stage::Processing, 100.0, "Chunked plan ready"));
        info!(
            operations = plan.operations.len(),
            folders = plan.folders_created,
            chunks_failed,
            "Chunked plan ready"
        );

        Ok(ProcessingOutcome {
            flow: Flow::Chunked,
            stats: ProcessingStats {
                duration: started.elapsed(),
                bookmarks_processed: records.len(),
                operations_generated: plan.operations.len(),
                chunks_processed: total - chunks_failed,
                chunks_failed,
                folders_created: plan.folders_created,
            },
            operations: plan.operations,
            warnings: plan.warnings,
            metadata: None,
            validation: Some(report),
        })
    }

    async fn process_batch(
        &self,
        context: &GlobalContext,
        number: usize,
        batch: &[BookmarkRecord],
        model: &str,
    ) -> Result<BatchProposal, PipelineError> {
        let messages = [
            ChatMessage::system(chunk_system_prompt(context)),
            ChatMessage::user(chunk_user_prompt(number, batch)),
        ];
        let options = CompletionOptions::default();

        let reply = with_api_retry(&self.retry, || {
            self.api.chat_completion(model, &messages, &options)
        })
        .await?;
        let response = parse_response_json(&reply)?;
        BatchProposal::from_response(&response, batch)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::llm::mock::ScriptedModelApi;
    use crate::llm::ApiError;
    use crate::metrics::fixtures::synthetic_tree;
    use crate::operations::Operation;
    use crate::pipeline::progress::{RecordingProgress, SilentProgress};

    fn batch_ids(messages: &[ChatMessage]) -> Vec<String> {
        let user = &messages[1].content;
        let start = user.find('[').unwrap_or(0);
        let end = user.rfind(']').map(|i| i + 1).unwrap_or(user.len());
        let listing: Vec<serde_json::Value> = serde_json::from_str(&user[start..end]).unwrap_or_default();
        listing
            .iter()
            .filter_map(|entry| entry["id"].as_str().map(str::to_string))
            .collect()
    }

    /// Every batch proposes a near-duplicate "dev tools" folder and assigns
    /// all of its bookmarks to it.
    fn dev_tools_responder() -> ScriptedModelApi {
        ScriptedModelApi::with_responder(|messages| {
            let ids = batch_ids(messages);
            let first: usize = ids.first().and_then(|id| id.parse().ok()).unwrap_or(0);
            // Odd batches spell the folder differently.
            let (handle, title) = if (first / 10) % 2 == 0 {
                ("h-dev-tools", "Dev Tools")
            } else {
                ("h-devtools", "DevTools ")
            };
            let operations: Vec<_> = ids
                .iter()
                .map(|id| json!({"type": "assign", "bookmarkId": id, "folderHandle": handle}))
                .collect();
            Ok(json!({
                "operations": operations,
                "pendingFolders": [{"handle": handle, "path": [], "title": title}]
            })
            .to_string())
        })
    }

    fn processor(api: Arc<ScriptedModelApi>, chunk_size: usize) -> ChunkingProcessor {
        ChunkingProcessor::new(api, RetryPolicy::immediate(2), chunk_size)
            .with_delay(ChunkDelay::none())
    }

    #[test]
    fn chunks_preserve_order_and_cover_everything() {
        let records = flatten_bookmarks(&synthetic_tree(3_000));
        let chunks = create_chunks(&records, 250);

        assert_eq!(chunks.len(), 12);
        assert!(chunks.iter().all(|chunk| chunk.len() == 250));
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.iter().map(|r| r.id.as_str())).collect();
        let original: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(rejoined, original);
        assert_eq!(create_chunks(&records[..10], 4).len(), 3);
    }

    #[test]
    fn delay_shrinks_near_the_end() {
        let delay = ChunkDelay {
            max_jitter: Duration::ZERO,
            ..ChunkDelay::default()
        };
        assert_eq!(delay.delay_for(0, 10), Duration::from_millis(2_000));
        assert_eq!(delay.delay_for(8, 10), Duration::from_millis(2_000));
        let tail = delay.delay_for(9, 10).as_secs_f64();
        assert!((tail - 1.4).abs() < 1e-6);

        let jittered = ChunkDelay::default().delay_for(0, 10);
        assert!(jittered >= Duration::from_millis(2_000));
        assert!(jittered < Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn near_duplicate_folders_across_batches_become_one() {
        let api = Arc::new(dev_tools_responder());
        let tree = synthetic_tree(40);
        let progress = RecordingProgress::default();

        let outcome = processor(api.clone(), 10)
            .process(&tree, "gpt-4o", &progress)
            .await
            .expect("outcome");

        assert_eq!(api.call_count(), 4);
        assert_eq!(outcome.stats.chunks_processed, 4);
        assert_eq!(outcome.stats.folders_created, 1);

        let dev = vec!["Bookmarks bar".to_string(), "Dev Tools".to_string()];
        assert_eq!(
            outcome.operations[0],
            Operation::create_folder(vec!["Bookmarks bar".to_string()], "Dev Tools")
        );
        let moved: HashSet<&str> = outcome.operations[1..]
            .iter()
            .filter_map(|op| match op {
                Operation::Move { bookmark_id, .. } => Some(bookmark_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(moved.len(), 40);
        assert!(outcome.operations[1..]
            .iter()
            .all(|op| matches!(op, Operation::Move { target_path, .. } if *target_path == dev)));

        // Later batches see earlier proposals in their context.
        let calls = api.calls();
        assert!(calls[0].0[0].content.contains("Previously created folders: None yet"));
        assert!(calls[1].0[0].content.contains("Dev Tools (h-dev-tools)"));
        assert!(calls[0].0[1].content.contains("Chunk number: 1"));

        let validation = outcome.validation.as_ref().expect("validation");
        assert!(validation.is_valid);
        assert!(validation.errors.is_empty());

        let events = progress.events();
        assert!(events.iter().any(|e| e.message == "Processing chunk 4/4..."));
        assert_eq!(events.last().map(|e| e.progress), Some(100));
    }

    #[tokio::test]
    async fn failed_batches_are_skipped() {
        let api = Arc::new(ScriptedModelApi::with_responder(|messages| {
            let ids = batch_ids(messages);
            if ids.iter().any(|id| id == "1010") {
                return Err(ApiError::from_status(500, "boom", "server_error"));
            }
            let operations: Vec<_> = ids
                .iter()
                .map(|id| json!({"type": "assign", "bookmarkId": id, "folderHandle": "h-reading"}))
                .collect();
            Ok(json!({
                "operations": operations,
                "pendingFolders": [{"handle": "h-reading", "title": "Reading"}]
            })
            .to_string())
        }));

        let outcome = processor(api.clone(), 10)
            .process(&synthetic_tree(30), "gpt-4o", &SilentProgress)
            .await
            .expect("outcome");

        // Batch two fails on both attempts; the others still contribute.
        assert_eq!(api.call_count(), 4);
        assert_eq!(outcome.stats.chunks_failed, 1);
        assert_eq!(outcome.stats.chunks_processed, 2);
        assert_eq!(outcome.operations.len(), 21);
        assert!(outcome.warnings.iter().any(|w| w.starts_with("Chunk 2 failed")));
    }

    #[tokio::test]
    async fn authentication_failure_stops_the_run() {
        let api = Arc::new(ScriptedModelApi::with_responder(|_| {
            Err(ApiError::from_status(401, "bad key", "invalid_request_error"))
        }));
        let err = processor(api.clone(), 10)
            .process(&synthetic_tree(30), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Api(ref api_err) if api_err.status == Some(401)));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn all_batches_failing_surfaces_the_error() {
        let api = Arc::new(ScriptedModelApi::with_responder(|_| Ok("not json".to_string())));
        let err = processor(api.clone(), 10)
            .process(&synthetic_tree(20), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedJson(_)));
        assert_eq!(api.call_count(), 2);
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_batches() {
        let cancel = CancellationFlag::new();
        let observer = cancel.clone();
        let api = Arc::new(ScriptedModelApi::with_responder(move |_| {
            observer.cancel();
            Ok(json!({"operations": [], "pendingFolders": []}).to_string())
        }));

        let err = processor(api.clone(), 10)
            .with_cancellation(cancel)
            .process(&synthetic_tree(30), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn replies_without_operations_count_as_failed_batches() {
        let api = Arc::new(ScriptedModelApi::with_responder(|messages| {
            let ids = batch_ids(messages);
            if ids.iter().any(|id| id == "1010") {
                return Ok(json!({"unexpected": true}).to_string());
            }
            let operations: Vec<_> = ids
                .iter()
                .map(|id| json!({"type": "assign", "bookmarkId": id, "folderHandle": "h-reading"}))
                .collect();
            Ok(json!({
                "operations": operations,
                "pendingFolders": [{"handle": "h-reading", "title": "Reading"}]
            })
            .to_string())
        }));

        let outcome = processor(api.clone(), 10)
            .process(&synthetic_tree(30), "gpt-4o", &SilentProgress)
            .await
            .expect("outcome");

        assert_eq!(api.call_count(), 3);
        assert_eq!(outcome.stats.chunks_failed, 1);
        assert_eq!(outcome.stats.chunks_processed, 2);
        assert!(outcome.warnings.iter().any(|w| w.starts_with("Chunk 2 failed")));
        assert!(outcome.validation.is_some());
    }

    #[tokio::test]
    async fn every_batch_replying_without_operations_fails_the_run() {
        let api = Arc::new(ScriptedModelApi::with_responder(|_| {
            Ok(json!({"unexpected": true}).to_string())
        }));
        let err = processor(api.clone(), 10)
            .process(&synthetic_tree(30), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidResponse { .. }));
        assert_eq!(api.call_count(), 3);
    }

    #[tokio::test]
    async fn assignments_for_other_batches_are_not_applied() {
        let api = Arc::new(ScriptedModelApi::with_responder(|messages| {
            let mut ids = batch_ids(messages);
            // Later batches also claim a bookmark from the first one.
            if !ids.iter().any(|id| id == "1000") {
                ids.push("1000".to_string());
            }
            let operations: Vec<_> = ids
                .iter()
                .map(|id| json!({"type": "assign", "bookmarkId": id, "folderHandle": "h-reading"}))
                .collect();
            Ok(json!({
                "operations": operations,
                "pendingFolders": [{"handle": "h-reading", "title": "Reading"}]
            })
            .to_string())
        }));

        let outcome = processor(api, 10)
            .process(&synthetic_tree(30), "gpt-4o", &SilentProgress)
            .await
            .expect("outcome");

        let moves = outcome
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Move { .. }))
            .count();
        assert_eq!(moves, 30);
        let skipped = outcome
            .warnings
            .iter()
            .filter(|w| w.starts_with("Skipped assign for bookmark 1000"))
            .count();
        assert_eq!(skipped, 2);
    }
}
