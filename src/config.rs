use std::env;
use std::path::PathBuf;

use anyhow::Context;

use crate::models::ModelRegistry;

/// Connection settings for the OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub enable_uploads: bool,
}

impl GatewayConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    pub fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .context("Set MARKSMITH_API_KEY (or OPENAI_API_KEY) to call the model API")
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            http_timeout_ms: 120_000,
            enable_uploads: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub model: String,
    pub retry_attempts: u32,
    pub chunk_delay_ms: u64,
    pub models_file: Option<PathBuf>,
}

impl AppConfig {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o";

    const API_KEY_VARS: [&'static str; 2] = ["MARKSMITH_API_KEY", "OPENAI_API_KEY"];
    const BASE_URL_VARS: [&'static str; 2] = ["MARKSMITH_BASE_URL", "OPENAI_BASE_URL"];
    const MODEL_VARS: [&'static str; 2] = ["MARKSMITH_MODEL", "OPENAI_MODEL"];
    const TIMEOUT_VARS: [&'static str; 1] = ["MARKSMITH_HTTP_TIMEOUT_MS"];
    const RETRY_VARS: [&'static str; 1] = ["MARKSMITH_RETRY_ATTEMPTS"];
    const CHUNK_DELAY_VARS: [&'static str; 1] = ["MARKSMITH_CHUNK_DELAY_MS"];
    const UPLOAD_VARS: [&'static str; 1] = ["MARKSMITH_ENABLE_UPLOADS"];
    const MODELS_FILE_VARS: [&'static str; 1] = ["MARKSMITH_MODELS_FILE"];

    pub fn from_env() -> anyhow::Result<Self> {
        let http_timeout_ms = Self::read_parsed(&Self::TIMEOUT_VARS)?.unwrap_or(120_000);
        let retry_attempts = Self::read_parsed(&Self::RETRY_VARS)?.unwrap_or(3);
        let chunk_delay_ms = Self::read_parsed(&Self::CHUNK_DELAY_VARS)?.unwrap_or(2_000);
        let enable_uploads = Self::read_env(&Self::UPLOAD_VARS)
            .map(|value| parse_flag(&value))
            .unwrap_or(false);

        Ok(Self {
            gateway: GatewayConfig {
                api_key: Self::read_env(&Self::API_KEY_VARS),
                base_url: Self::read_env(&Self::BASE_URL_VARS)
                    .unwrap_or_else(|| GatewayConfig::DEFAULT_BASE_URL.to_string()),
                http_timeout_ms,
                enable_uploads,
            },
            model: Self::read_env(&Self::MODEL_VARS)
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            retry_attempts,
            chunk_delay_ms,
            models_file: Self::read_env(&Self::MODELS_FILE_VARS).map(PathBuf::from),
        })
    }

    /// Built-in registry unless a models file is configured.
    pub fn load_registry(&self) -> anyhow::Result<ModelRegistry> {
        match &self.models_file {
            Some(path) => ModelRegistry::from_json_file(path),
            None => Ok(ModelRegistry::builtin()),
        }
    }

    fn read_env(candidates: &[&'static str]) -> Option<String> {
        candidates
            .iter()
            .find_map(|key| env::var(key).ok())
            .filter(|value| !value.trim().is_empty())
    }

    fn read_parsed<T>(candidates: &[&'static str]) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Self::read_env(candidates)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .with_context(|| format!("Invalid value '{value}' for {}", candidates[0]))
            })
            .transpose()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            model: Self::DEFAULT_MODEL.to_string(),
            retry_attempts: 3,
            chunk_delay_ms: 2_000,
            models_file: None,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
