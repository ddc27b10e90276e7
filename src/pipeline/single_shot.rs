use std::time::Instant;

use serde_json::Value;
use tracing::{info, instrument, warn};

use super::progress::{ProgressEvent, ProgressSink, Stage};
use super::prompts::{
    single_shot_system_prompt, single_shot_user_prompt, TreePayload, MAX_TOP_LEVEL_FOLDERS,
};
use super::{ProcessingOutcome, ProcessingStats};
use crate::bookmarks::{default_root_path, flatten_bookmarks, BookmarkNode};
use crate::compression;
use crate::error::PipelineError;
use crate::llm::{with_api_retry, ChatMessage, CompletionOptions, RetryPolicy, SharedModelApi};
use crate::metrics::extract_statistics;
use crate::models::Flow;
use crate::operations::validator::{parse_operations, parse_response_json, repair_legacy};
use crate::operations::validate_response;

const SINGLE_SHOT_MAX_TOKENS: u32 = 8_000;

/// Sends the whole tree in one request and validates the reply.
pub struct SingleShotProcessor {
    api: SharedModelApi,
    retry: RetryPolicy,
}

impl SingleShotProcessor {
    pub fn new(api: SharedModelApi, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    #[instrument(skip_all, fields(model = model))]
    pub async fn process(
        &self,
        tree: &[BookmarkNode],
        model: &str,
        progress: &dyn ProgressSink,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let started = Instant::now();
        let records = flatten_bookmarks(tree);
        let stats = extract_statistics(tree);

        progress.report(ProgressEvent::new(Stage::Processing, 20.0, "Compressing data..."));
        let serialized = serde_json::to_string_pretty(tree).map_err(PipelineError::Serialization)?;

        let file_id = if self.api.supports_file_upload() {
            progress.report(ProgressEvent::new(Stage::Processing, 30.0, "Uploading to AI..."));
            let gzip = compression::gzip(serialized.as_bytes())?;
            let id = with_api_retry(&self.retry, || self.api.upload_file(gzip.clone())).await?;
            info!(file_id = %id, bytes = gzip.len(), "Uploaded bookmark tree");
            Some(id)
        } else {
            None
        };

        let reply = self
            .request_plan(&stats, file_id.as_deref(), &serialized, model, progress)
            .await;

        if let Some(id) = &file_id {
            if let Err(err) = self.api.delete_file(id).await {
                warn!(file_id = %id, error = %err, "Failed to delete uploaded file");
            }
        }

        progress.report(ProgressEvent::new(
            Stage::Validating,
            70.0,
            "Validating AI response...",
        ));
        let response = parse_response_json(&reply?)?;
        let validation = validate_response(&response, &records).into_result()?;

        let mut warnings = validation.warnings.clone();
        warnings.extend(model_warnings(&response));

        let operations = if response.get("version").is_some() {
            let parsed = parse_operations(&response);
            warnings.extend(parsed.rejected);
            parsed.operations
        } else {
            // Legacy category replies are repaired and mapped onto folder moves.
            let root = default_root_path(tree);
            repair_legacy(&response, &records)
                .map(|plan| plan.into_operations(&records, &root))
                .unwrap_or_default()
        };

        progress.report(ProgressEvent::new(Stage::Processing, 100.0, "Analysis complete"));
        info!(operations = operations.len(), "Single-shot plan ready");

        Ok(ProcessingOutcome {
            flow: Flow::SingleShot,
            stats: ProcessingStats {
                duration: started.elapsed(),
                bookmarks_processed: records.len(),
                operations_generated: operations.len(),
                ..ProcessingStats::default()
            },
            operations,
            warnings,
            metadata: response.get("metadata").cloned(),
            validation: Some(validation),
        })
    }

    async fn request_plan(
        &self,
        stats: &crate::metrics::TreeStatistics,
        file_id: Option<&str>,
        serialized: &str,
        model: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, PipelineError> {
        let payload = match file_id {
            Some(file_id) => TreePayload::Uploaded { file_id },
            None => TreePayload::Inline { json: serialized },
        };
        let messages = [
            ChatMessage::system(single_shot_system_prompt(MAX_TOP_LEVEL_FOLDERS)),
            ChatMessage::user(single_shot_user_prompt(stats, payload)),
        ];
        let options = CompletionOptions::default().with_max_tokens(SINGLE_SHOT_MAX_TOKENS);

        progress.report(ProgressEvent::new(
            Stage::Processing,
            50.0,
            "AI analyzing bookmarks...",
        ));
        let reply = with_api_retry(&self.retry, || {
            self.api.chat_completion(model, &messages, &options)
        })
        .await?;
        Ok(reply)
    }
}

fn model_warnings(response: &Value) -> Vec<String> {
    response
        .get("warnings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|warning| format!("Model: {warning}"))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::llm::mock::ScriptedModelApi;
    use crate::llm::ApiError;
    use crate::operations::Operation;
    use crate::pipeline::progress::SilentProgress;

    fn tree() -> Vec<BookmarkNode> {
        vec![BookmarkNode::folder(
            "0",
            "",
            vec![
                BookmarkNode::folder(
                    "1",
                    "Bookmarks bar",
                    vec![
                        BookmarkNode::bookmark("10", "Rust", "https://www.rust-lang.org"),
                        BookmarkNode::bookmark("11", "BBC", "https://www.bbc.co.uk/news"),
                    ],
                ),
                BookmarkNode::folder("2", "Other bookmarks", vec![]),
            ],
        )]
    }

    fn processor(api: Arc<ScriptedModelApi>) -> SingleShotProcessor {
        SingleShotProcessor::new(api, RetryPolicy::immediate(3))
    }

    fn plan_reply() -> String {
        json!({
            "version": "2025-05-01",
            "metadata": {"analysisSummary": {"notes": "two topics"}},
            "operations": [
                {"type": "create_folder", "path": ["Bookmarks bar"], "title": "Dev"},
                {"type": "move", "bookmarkId": "10", "targetPath": ["Bookmarks bar", "Dev"]}
            ],
            "warnings": ["small collection"]
        })
        .to_string()
    }

    #[tokio::test]
    async fn inline_request_returns_typed_operations() {
        let api = Arc::new(ScriptedModelApi::with_replies([Ok(plan_reply())]));
        let outcome = processor(api.clone())
            .process(&tree(), "gpt-4o", &SilentProgress)
            .await
            .expect("outcome");

        assert_eq!(outcome.operations.len(), 2);
        assert_eq!(
            outcome.operations[1],
            Operation::move_to("10", vec!["Bookmarks bar".into(), "Dev".into()])
        );
        assert_eq!(outcome.warnings, vec!["Model: small collection".to_string()]);
        assert!(outcome.metadata.is_some());

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        let (messages, options) = &calls[0];
        assert_eq!(options.max_tokens, 8_000);
        assert!(options.json_mode);
        assert!(messages[1].content.contains("https://www.rust-lang.org"));
        assert!(messages[1].content.contains("News & Information"));
    }

    #[tokio::test]
    async fn uploaded_file_is_deleted_even_when_cleanup_fails() {
        let api = Arc::new(ScriptedModelApi::with_replies([Ok(plan_reply())]).with_uploads(true));
        let outcome = processor(api.clone())
            .process(&tree(), "gpt-4o", &SilentProgress)
            .await;

        assert!(outcome.is_ok(), "cleanup failure must not fail the run");
        assert_eq!(api.uploads().len(), 1);
        let gunzipped = compression::gunzip(&api.uploads()[0]).expect("gzip payload");
        assert!(String::from_utf8_lossy(&gunzipped).contains("Bookmarks bar"));
        assert!(api.calls()[0].0[1].content.contains("file-1"));
    }

    #[tokio::test]
    async fn upload_is_cleaned_up_after_api_failure() {
        let api = Arc::new(
            ScriptedModelApi::with_replies([Err(ApiError::from_status(
                401,
                "bad key",
                "invalid_request_error",
            ))])
            .with_uploads(false),
        );
        let err = processor(api.clone())
            .process(&tree(), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Api(ref api_err) if api_err.status == Some(401)));
        assert_eq!(api.deleted(), vec!["file-1".to_string()]);
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn invalid_reply_lists_validator_errors() {
        let reply = json!({"version": "1", "operations": [{"type": "nuke", "path": ["x"]}]});
        let api = Arc::new(ScriptedModelApi::with_replies([Ok(reply.to_string())]));
        let err = processor(api)
            .process(&tree(), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();

        match err {
            PipelineError::InvalidResponse { errors } => {
                assert_eq!(errors, vec!["Unsupported operation type: nuke".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_not_retried() {
        let api = Arc::new(ScriptedModelApi::with_replies([Ok("Sure! Here you go".to_string())]));
        let err = processor(api.clone())
            .process(&tree(), "gpt-4o", &SilentProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MalformedJson(_)));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn legacy_reply_becomes_folder_moves() {
        let reply = json!({"categories": [{"category": "Dev", "urls": ["https://www.rust-lang.org"]}]});
        let api = Arc::new(ScriptedModelApi::with_replies([Ok(reply.to_string())]));
        let outcome = processor(api)
            .process(&tree(), "gpt-4o", &SilentProgress)
            .await
            .expect("outcome");

        let root = vec!["Bookmarks bar".to_string()];
        assert_eq!(
            outcome.operations,
            vec![
                Operation::create_folder(root.clone(), "Dev"),
                Operation::create_folder(root.clone(), "Miscellaneous"),
                Operation::move_to("10", vec!["Bookmarks bar".into(), "Dev".into()]),
                Operation::move_to("11", vec!["Bookmarks bar".into(), "Miscellaneous".into()]),
            ]
        );
    }
}
