use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Overall processing strategy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flow {
    SingleShot,
    Chunked,
    Unsupported,
}

impl Flow {
    pub const ALL: [Flow; 3] = [Flow::SingleShot, Flow::Chunked, Flow::Unsupported];

    pub fn as_str(self) -> &'static str {
        match self {
            Flow::SingleShot => "single-shot",
            Flow::Chunked => "chunked",
            Flow::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flow {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Flow::ALL
            .into_iter()
            .find(|flow| flow.as_str() == value.trim())
            .ok_or_else(|| format!("Unsupported flow: {value}"))
    }
}

/// Ordinal size bucket; T4 is terminal and has no processing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
    T4,
}

impl Tier {
    pub const BOUNDED: [Tier; 3] = [Tier::T1, Tier::T2, Tier::T3];

    pub fn is_terminal(self) -> bool {
        self == Tier::T4
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Tier::T1 => "T1",
            Tier::T2 => "T2",
            Tier::T3 => "T3",
            Tier::T4 => "T4",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub provider: String,
    pub context_window: u64,
    pub max_output_tokens: u64,
    #[serde(default)]
    pub supports_json_mode: bool,
    #[serde(default, rename = "supportsFilesAPI")]
    pub supports_files_api: bool,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub recommended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierThresholds {
    pub max_bookmarks: u64,
    pub max_tokens: u64,
    pub max_gzip_bytes: u64,
    #[serde(default)]
    pub recommended_model: Option<String>,
    pub flow: Flow,
}

impl TierThresholds {
    /// Bounds are inclusive: a value exactly at a limit still fits.
    pub fn admits(&self, bookmark_count: u64, estimated_tokens: u64, gzip_bytes: u64) -> bool {
        bookmark_count <= self.max_bookmarks
            && estimated_tokens <= self.max_tokens
            && gzip_bytes <= self.max_gzip_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub single_shot_max_gzip_bytes: u64,
    pub single_shot_max_tokens: u64,
    pub chunk_size: usize,
    pub safety_margin: f64,
    #[serde(default = "Thresholds::default_max_raw_bytes")]
    pub max_raw_bytes: u64,
}

impl Thresholds {
    fn default_max_raw_bytes() -> u64 {
        10 * 1024 * 1024
    }
}

/// Model capabilities, tier bounds, and flow thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRegistry {
    pub version: String,
    pub models: BTreeMap<String, ModelSpec>,
    pub tiers: BTreeMap<Tier, TierThresholds>,
    pub thresholds: Thresholds,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        let models = [
            ("gpt-4o", 128_000, 16_384, 0.0025, 0.01, 9, true),
            ("gpt-4o-mini", 128_000, 16_384, 0.00015, 0.0006, 8, false),
            ("gpt-4-turbo", 128_000, 4_096, 0.01, 0.03, 9, false),
            ("gpt-3.5-turbo", 16_385, 4_096, 0.0005, 0.0015, 7, false),
        ]
        .into_iter()
        .map(
            |(name, context_window, max_output_tokens, input, output, quality, recommended)| {
                (
                    name.to_string(),
                    ModelSpec {
                        provider: "openai".to_string(),
                        context_window,
                        max_output_tokens,
                        supports_json_mode: true,
                        supports_files_api: true,
                        cost_per_1k_input: input,
                        cost_per_1k_output: output,
                        quality,
                        recommended,
                    },
                )
            },
        )
        .collect();

        let tiers = [
            (Tier::T1, 2_000, 110_000, 61_440, Flow::SingleShot),
            (Tier::T2, 4_500, 220_000, 184_320, Flow::SingleShot),
            (Tier::T3, 10_000, 500_000, 368_640, Flow::Chunked),
        ]
        .into_iter()
        .map(|(tier, max_bookmarks, max_tokens, max_gzip_bytes, flow)| {
            (
                tier,
                TierThresholds {
                    max_bookmarks,
                    max_tokens,
                    max_gzip_bytes,
                    recommended_model: Some("gpt-4o".to_string()),
                    flow,
                },
            )
        })
        .collect();

        Self {
            version: "2025.01".to_string(),
            models,
            tiers,
            thresholds: Thresholds {
                single_shot_max_gzip_bytes: 327_680,
                single_shot_max_tokens: 220_000,
                chunk_size: 250,
                safety_margin: 0.7,
                max_raw_bytes: Thresholds::default_max_raw_bytes(),
            },
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model registry {}", path.display()))?;
        let registry: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse model registry {}", path.display()))?;
        anyhow::ensure!(
            registry.thresholds.chunk_size > 0,
            "Model registry chunkSize must be positive"
        );
        Ok(registry)
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&ModelSpec, PipelineError> {
        self.model(id)
            .ok_or_else(|| PipelineError::UnknownModel(id.to_string()))
    }

    pub fn tier_thresholds(&self, tier: Tier) -> Option<&TierThresholds> {
        self.tiers.get(&tier)
    }

    /// Smallest tier whose thresholds all hold; T4 when none does.
    pub fn classify(&self, bookmark_count: u64, estimated_tokens: u64, gzip_bytes: u64) -> Tier {
        Tier::BOUNDED
            .into_iter()
            .find(|tier| {
                self.tier_thresholds(*tier).is_some_and(|limits| {
                    limits.admits(bookmark_count, estimated_tokens, gzip_bytes)
                })
            })
            .unwrap_or(Tier::T4)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
