//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to a model runtime.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the runtime endpoint failed.
    #[error("runtime unavailable at {endpoint}: {reason}")]
    UpstreamUnavailable { endpoint: String, reason: String },

    /// Non-2xx HTTP response from the runtime endpoint.
    #[error("runtime returned HTTP {status}: {body}")]
    UpstreamError { status: u16, body: String },

    /// The runtime answered, but the body could not be understood.
    #[error("malformed runtime response: {reason}")]
    MalformedResponse { reason: String },

    /// No fragment arrived within the configured idle interval.
    #[error("no fragment from runtime within {duration_ms}ms")]
    UpstreamTimeout { duration_ms: u64 },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the failure is transient and a caller-side retry may succeed.
    ///
    /// HTTP 502–504 from a reverse proxy in front of the runtime count as
    /// transient; other statuses are the runtime rejecting the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InferenceError::UpstreamUnavailable { .. }
                | InferenceError::UpstreamTimeout { .. }
                | InferenceError::UpstreamError {
                    status: 502..=504,
                    ..
                }
        )
    }

    /// Build the error for a `reqwest` failure while sending a request.
    pub(crate) fn from_send(endpoint: &str, err: &reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            InferenceError::UpstreamTimeout {
                duration_ms: timeout_ms,
            }
        } else {
            InferenceError::UpstreamUnavailable {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
