//! Relay configuration loading and validation.
//!
//! Reads `relay.yaml` and resolves environment variables. The file is the
//! single source of truth for runtime endpoints, cache sizing, pipeline
//! limits and the known model configs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "relay.yaml";

/// Environment variable holding an explicit config path.
pub const CONFIG_ENV_VAR: &str = "LOCALRELAY_CONFIG";

// ─── Model Configs ───────────────────────────────────────────────────────────

/// Which kind of runtime serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    Vllm,
    /// Any other OpenAI-compatible server; needs `base_url` on the model.
    Other,
}

/// A single model's configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry key. Filled from the `models:` map key when loading.
    #[serde(default)]
    pub name: String,
    pub provider: Provider,
    /// Runtime-side identifier, e.g. `llama3:8b` for Ollama.
    pub path: String,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub is_embedding_model: bool,
    /// Endpoint override. Required for `Provider::Other`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ModelConfig {
    /// A config with default limits, as produced by runtime discovery.
    pub fn discovered(name: &str, provider: Provider, path: &str) -> Self {
        Self {
            name: name.to_string(),
            provider,
            path: path.to_string(),
            context_length: default_context_length(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            supports_streaming: true,
            supports_tools: provider == Provider::Ollama,
            is_embedding_model: name.contains("embed"),
            base_url: None,
        }
    }
}

fn default_context_length() -> u32 {
    4096
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}

// ─── Runtime / Cache / Pipeline Sections ─────────────────────────────────────

/// Endpoint of one runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
}

/// `runtimes:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimesConfig {
    #[serde(default = "default_ollama_endpoint")]
    pub ollama: EndpointConfig,
    #[serde(default = "default_vllm_endpoint")]
    pub vllm: EndpointConfig,
    /// TCP connect timeout for every runtime.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            ollama: default_ollama_endpoint(),
            vllm: default_vllm_endpoint(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_ollama_endpoint() -> EndpointConfig {
    EndpointConfig {
        base_url: "http://localhost:11434".into(),
    }
}
fn default_vllm_endpoint() -> EndpointConfig {
    EndpointConfig {
        base_url: "http://localhost:8001".into(),
    }
}
fn default_connect_timeout_secs() -> u64 {
    5
}

/// `cache:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum resident model instances.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Upper bound on waiting for a free slot when every instance is pinned.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Models warmed at startup, in order.
    #[serde(default)]
    pub preload: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            preload: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn default_capacity() -> usize {
    3
}
fn default_acquire_timeout_secs() -> u64 {
    30
}

/// `pipeline:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tool round-trips allowed before the pipeline forces finalization.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Bound on a whole exchange, tool round-trips included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bound on the gap between two upstream fragments.
    #[serde(default = "default_fragment_timeout_secs")]
    pub fragment_timeout_secs: u64,
    /// Frames buffered between the generation task and a streaming client.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Prepend a system message describing the tool-call grammar.
    #[serde(default = "default_true")]
    pub inject_tool_prompt: bool,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            request_timeout_secs: default_request_timeout_secs(),
            fragment_timeout_secs: default_fragment_timeout_secs(),
            stream_buffer: default_stream_buffer(),
            inject_tool_prompt: true,
            max_tool_result_chars: default_max_tool_result_chars(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_max_tool_rounds() -> usize {
    5
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_fragment_timeout_secs() -> u64 {
    60
}
fn default_stream_buffer() -> usize {
    16
}
fn default_max_tool_result_chars() -> usize {
    6_000
}
fn default_tool_timeout_secs() -> u64 {
    10
}

/// Top-level configuration (mirrors `relay.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub runtimes: RuntimesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

impl RelayConfig {
    /// Parse and validate a YAML document (after env-var interpolation).
    pub fn from_yaml_str(raw: &str) -> Result<Self, InferenceError> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: RelayConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to parse config: {e}"),
            })?;

        for (key, model) in config.models.iter_mut() {
            model.name = key.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cache or pipeline cannot run with.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.cache.capacity == 0 {
            return Err(InferenceError::ConfigError {
                reason: "cache.capacity must be at least 1".into(),
            });
        }
        if self.pipeline.stream_buffer == 0 {
            return Err(InferenceError::ConfigError {
                reason: "pipeline.stream_buffer must be at least 1".into(),
            });
        }
        for model in self.models.values() {
            if model.path.trim().is_empty() {
                return Err(InferenceError::ConfigError {
                    reason: format!("model '{}' has an empty path", model.name),
                });
            }
            if model.provider == Provider::Other && model.base_url.is_none() {
                return Err(InferenceError::ConfigError {
                    reason: format!(
                        "model '{}' uses provider 'other' but sets no base_url",
                        model.name
                    ),
                });
            }
        }
        for name in &self.cache.preload {
            if !self.models.contains_key(name) {
                return Err(InferenceError::ConfigError {
                    reason: format!("cache.preload names unknown model '{name}'"),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `relay.yaml`.
///
/// `LOCALRELAY_CONFIG` wins when it points at an existing file; otherwise
/// the search walks upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not point at a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate and validate the configuration file.
pub fn load_config(path: &Path) -> Result<RelayConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = RelayConfig::from_yaml_str(&raw)?;
    tracing::info!(
        path = %path.display(),
        models = config.models.len(),
        capacity = config.cache.capacity,
        "loaded relay config"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();
        let expr: String = chars.by_ref().take_while(|c| *c != '}').collect();
        result.push_str(&resolve_var_expr(&expr));
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
