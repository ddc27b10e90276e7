use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::client::{ChatMessage, CompletionOptions, ModelApi};
use super::error::ApiError;
use crate::config::GatewayConfig;
use crate::models::ModelRegistry;

const UPLOAD_FILENAME: &str = "bookmarks.json.gz";
const UPLOAD_PURPOSE: &str = "assistants";

/// Minimal HTTP client for an OpenAI-compatible REST surface.
pub struct OpenAiGateway {
    http: reqwest::Client,
    config: GatewayConfig,
    json_mode_models: HashSet<String>,
}

impl OpenAiGateway {
    pub fn new(config: GatewayConfig, registry: &ModelRegistry) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.http_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build model API HTTP client")?;

        let json_mode_models = registry
            .models
            .iter()
            .filter(|(_, spec)| spec.supports_json_mode)
            .map(|(name, _)| name.clone())
            .collect();

        Ok(Self {
            http,
            config,
            json_mode_models,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn chat_body(&self, model: &str, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "top_p": 0.9,
            "presence_penalty": 0.1,
            "frequency_penalty": 0.1,
        });
        if options.json_mode && self.json_mode_models.contains(model) {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    /// Probe `GET /models`. `Ok(false)` means the provider rejected the key.
    pub async fn validate_api_key(&self) -> Result<bool, ApiError> {
        let response = self
            .apply_auth(self.http.get(self.endpoint("models")))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            _ => Err(error_from_response(response).await),
        }
    }
}

#[async_trait]
impl ModelApi for OpenAiGateway {
    #[instrument(level = "debug", skip_all, fields(model = model))]
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ApiError> {
        let body = self.chat_body(model, messages, options);
        let response = self
            .apply_auth(self.http.post(self.endpoint("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let completion = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| ApiError::invalid_response(format!("Unreadable completion: {err}")))?;

        if let Some(usage) = &completion.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Chat completion finished"
            );
        }

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ApiError::invalid_response("Completion did not contain any choices"))
    }

    fn supports_file_upload(&self) -> bool {
        self.config.enable_uploads
    }

    async fn upload_file(&self, gzip: Vec<u8>) -> Result<String, ApiError> {
        let part = Part::bytes(gzip)
            .file_name(UPLOAD_FILENAME)
            .mime_str("application/gzip")
            .map_err(transport_error)?;
        let form = Form::new().text("purpose", UPLOAD_PURPOSE).part("file", part);

        let response = self
            .apply_auth(self.http.post(self.endpoint("files")))
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let file = response
            .json::<FileObject>()
            .await
            .map_err(|err| ApiError::invalid_response(format!("Unreadable upload reply: {err}")))?;
        Ok(file.id)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        let path = format!("files/{file_id}");
        let response = self
            .apply_auth(self.http.delete(self.endpoint(&path)))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    ApiError::transport(err.to_string())
}

async fn error_from_response(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    parse_provider_error(status.as_u16(), &body)
}

/// Map `{error: {message, type, code}}` onto an `ApiError`; plain-text bodies
/// fall back to the HTTP reason phrase.
fn parse_provider_error(status: u16, body: &str) -> ApiError {
    let parsed = serde_json::from_str::<ProviderErrorBody>(body)
        .ok()
        .map(|envelope| envelope.error);

    let message = parsed
        .as_ref()
        .and_then(|detail| detail.message.clone())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            StatusCode::from_u16(status)
                .ok()
                .and_then(|code| code.canonical_reason())
                .unwrap_or("Request failed")
                .to_string()
        });

    let error_type = parsed
        .as_ref()
        .and_then(|detail| {
            if detail.code.as_deref() == Some("insufficient_quota") {
                detail.code.clone()
            } else {
                detail.error_type.clone().or_else(|| detail.code.clone())
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    ApiError::from_status(status, message, error_type)
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}
