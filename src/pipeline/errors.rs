//! Pipeline error types and their client-facing mapping.

use serde_json::{json, Value};
use thiserror::Error;

use crate::cache::errors::CacheError;
use crate::inference::errors::InferenceError;

/// Errors surfaced by `CompletionPipeline`.
///
/// Tool failures never appear here; they are folded into the conversation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("model not found: {name}")]
    ModelNotFound { name: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("upstream error: {reason}")]
    UpstreamError { reason: String },

    #[error("upstream timed out after {duration_ms}ms")]
    UpstreamTimeout { duration_ms: u64 },

    /// The streaming consumer went away; nothing is left to report to.
    #[error("client disconnected")]
    ClientGone,
}

impl PipelineError {
    /// HTTP-equivalent status for the collaborator serving requests.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::ModelNotFound { .. } | PipelineError::InvalidRequest { .. } => 400,
            PipelineError::UpstreamUnavailable { .. } => 503,
            PipelineError::UpstreamError { .. } => 502,
            PipelineError::UpstreamTimeout { .. } => 504,
            PipelineError::ClientGone => 499,
        }
    }

    /// Whether the caller may reasonably retry. The pipeline never retries.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamUnavailable { .. } | PipelineError::UpstreamTimeout { .. }
        )
    }

    /// OpenAI error `type` for a non-streaming error body.
    pub fn error_type(&self) -> &'static str {
        if self.status_code() == 400 {
            "invalid_request_error"
        } else {
            "server_error"
        }
    }

    /// OpenAI-style error body: `{"error": {message, type, code}}`.
    pub fn to_error_body(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.status_code(),
            }
        })
    }
}

impl From<InferenceError> for PipelineError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::UpstreamUnavailable { .. } => PipelineError::UpstreamUnavailable {
                reason: err.to_string(),
            },
            InferenceError::UpstreamTimeout { duration_ms } => {
                PipelineError::UpstreamTimeout { duration_ms }
            }
            InferenceError::UpstreamError { .. }
            | InferenceError::MalformedResponse { .. }
            | InferenceError::ConfigError { .. } => PipelineError::UpstreamError {
                reason: err.to_string(),
            },
        }
    }
}

impl From<CacheError> for PipelineError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::ModelNotFound { name } => PipelineError::ModelNotFound { name },
            CacheError::AcquireTimeout { waited_ms, .. } => PipelineError::UpstreamTimeout {
                duration_ms: waited_ms,
            },
            CacheError::Runtime(e) => e.into(),
        }
    }
}
