//! Inference layer: talking to local model runtimes.
//!
//! - `ModelRuntimeClient` trait plus Ollama and OpenAI-compatible clients
//! - NDJSON and SSE fragment parsing with idle timeouts
//! - `relay.yaml` loading (runtimes, cache, pipeline, model configs)
//! - token estimation for runtimes that omit usage counters
//!
//! Switching a model between Ollama and vLLM is a config change, not a code
//! change.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod tokens;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ModelRuntimeClient, OllamaClient, OpenAiCompatClient, RuntimeSet};
pub use config::{CacheConfig, ModelConfig, PipelineConfig, Provider, RelayConfig};
pub use errors::InferenceError;
pub use streaming::FragmentStream;
pub use types::{Fragment, GenerateRequest, GenerationOptions, Message, Role, Usage};
