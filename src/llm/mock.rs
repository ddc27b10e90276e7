use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::{ChatMessage, CompletionOptions, ModelApi};
use super::error::ApiError;

type Responder = Box<dyn Fn(&[ChatMessage]) -> Result<String, ApiError> + Send + Sync>;

/// In-memory `ModelApi` that replays queued replies or computes them per call.
#[derive(Default)]
pub struct ScriptedModelApi {
    script: Mutex<VecDeque<Result<String, ApiError>>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<(Vec<ChatMessage>, CompletionOptions)>>,
    uploads: Mutex<Vec<Vec<u8>>>,
    deleted: Mutex<Vec<String>>,
    upload_enabled: bool,
    fail_delete: bool,
    id_counter: AtomicU64,
}

impl ScriptedModelApi {
    pub fn with_replies(replies: impl IntoIterator<Item = Result<String, ApiError>>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_responder(
        responder: impl Fn(&[ChatMessage]) -> Result<String, ApiError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    pub fn with_uploads(mut self, fail_delete: bool) -> Self {
        self.upload_enabled = true;
        self.fail_delete = fail_delete;
        self
    }

    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, CompletionOptions)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.uploads.lock().expect("uploads lock").clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted lock").clone()
    }
}

#[async_trait]
impl ModelApi for ScriptedModelApi {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ApiError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((messages.to_vec(), options.clone()));

        if let Some(responder) = &self.responder {
            return responder(messages);
        }
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::invalid_response("script exhausted")))
    }

    fn supports_file_upload(&self) -> bool {
        self.upload_enabled
    }

    async fn upload_file(&self, gzip: Vec<u8>) -> Result<String, ApiError> {
        if !self.upload_enabled {
            return Err(ApiError::unsupported("File upload"));
        }
        self.uploads.lock().expect("uploads lock").push(gzip);
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("file-{id}"))
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        if self.fail_delete {
            return Err(ApiError::from_status(500, "delete failed", "server_error"));
        }
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(file_id.to_string());
        Ok(())
    }
}
