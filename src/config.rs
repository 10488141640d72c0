use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration, loaded from a TOML file.
///
/// All provider selection is explicit here; nothing in the engine reads
/// ambient process state beyond resolving the named API key variable once.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// OpenAI-compatible API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Model used for testset synthesis
    pub model: String,
    /// Model used for judging; defaults to `model`
    #[serde(default)]
    pub judge_model: Option<String>,
    /// Temperature for synthesis (the judge always runs cold)
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts per model call before a transient error becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Ceiling on simultaneous outstanding model calls
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Fresh-sample retries per testset item on malformed synthesis output
    #[serde(default = "default_max_retries_per_item")]
    pub max_retries_per_item: u32,
    /// Minimum content-word overlap between a reference answer and its
    /// source chunk for the answer to count as grounded
    #[serde(default = "default_grounding_overlap_threshold")]
    pub grounding_overlap_threshold: f64,
    /// Adjacent chunks per sampled cluster; 1 means single-chunk questions
    #[serde(default = "default_hop_span")]
    pub hop_span: usize,
    /// Sampling seed for reproducible generation runs
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_max_retries_per_item() -> u32 {
    3
}

fn default_grounding_overlap_threshold() -> f64 {
    0.3
}

fn default_hop_span() -> usize {
    1
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency_limit == 0 {
            return Err(EngineError::Config(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.hop_span == 0 {
            return Err(EngineError::Config("hop_span must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.grounding_overlap_threshold) {
            return Err(EngineError::Config(
                "grounding_overlap_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Model name the judge should use.
    pub fn judge_model(&self) -> &str {
        self.judge_model.as_deref().unwrap_or(&self.model)
    }

    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String, EngineError> {
        std::env::var(&self.env_var_api_key).map_err(|_| {
            EngineError::Config(format!(
                "environment variable {} not set",
                self.env_var_api_key
            ))
        })
    }
}
