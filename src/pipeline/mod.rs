//! Completion pipeline: OpenAI-compatible requests in, aggregate responses
//! or SSE frames out.
//!
//! - `CompletionPipeline` drives generation turns and tool round-trips
//! - `protocol` holds the request and response wire shapes
//! - `sse` frames streamed output

pub mod completion;
pub mod errors;
pub mod protocol;
pub mod sse;

pub use completion::{
    Completion, CompletionOutput, CompletionPipeline, CompletionStream, PipelineSettings,
    PipelineState,
};
pub use errors::PipelineError;
pub use protocol::{ChatCompletion, ChatCompletionChunk, CompletionRequest, UsageBlock};
pub use sse::{SseFramer, DONE_FRAME};
