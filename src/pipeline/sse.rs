//! Server-sent-event framing for streamed completions.
//!
//! Every frame is `data: <payload>\n\n`. A stream is content frames, then
//! exactly one terminal frame (stop chunk or error), then `data: [DONE]`.

use serde_json::json;

use super::errors::PipelineError;
use super::protocol::{ChatCompletionChunk, ChunkChoice, Delta};

/// The literal end-of-stream sentinel frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Builds frames for one completion (fixed id, timestamp and model).
#[derive(Debug, Clone)]
pub struct SseFramer {
    id: String,
    created: i64,
    model: String,
}

impl SseFramer {
    pub fn new(id: &str, created: i64, model: &str) -> Self {
        Self {
            id: id.to_string(),
            created,
            model: model.to_string(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&str>) -> String {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        };
        match serde_json::to_string(&chunk) {
            Ok(json) => frame(&json),
            Err(e) => self.error_message(&format!("failed to encode chunk: {e}"), 500),
        }
    }

    /// A content frame carrying `text`.
    pub fn content(&self, text: &str) -> String {
        self.chunk(
            Delta {
                content: Some(text.to_string()),
            },
            None,
        )
    }

    /// The terminal frame of a successful stream.
    pub fn stop(&self) -> String {
        self.chunk(Delta::default(), Some("stop"))
    }

    /// The terminal frame of a failed stream.
    pub fn error(&self, err: &PipelineError) -> String {
        self.error_message(&err.to_string(), err.status_code())
    }

    fn error_message(&self, message: &str, code: u16) -> String {
        let body = json!({
            "error": {
                "message": message,
                "type": "server_error",
                "code": code,
            }
        });
        frame(&body.to_string())
    }
}

fn frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// The JSON payload of a frame, or `None` for the sentinel.
pub fn frame_payload(frame: &str) -> Option<&str> {
    let payload = frame.strip_prefix("data: ")?.strip_suffix("\n\n")?;
    (payload != "[DONE]").then_some(payload)
}
