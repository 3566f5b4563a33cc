//! Model cache error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors returned by `ModelCache`.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The name matches no known model config.
    #[error("model not found: {name}")]
    ModelNotFound { name: String },

    /// Every resident instance stayed pinned for the whole acquire bound.
    #[error("timed out after {waited_ms}ms waiting for a free cache slot for {name}")]
    AcquireTimeout { name: String, waited_ms: u64 },

    /// No runtime client could be resolved for the model.
    #[error(transparent)]
    Runtime(#[from] InferenceError),
}
