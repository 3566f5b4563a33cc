//! Streaming response parsers for the supported runtime wire formats.
//!
//! Ollama streams newline-delimited JSON; vLLM and other OpenAI-compatible
//! servers stream SSE (`data: …` lines ending with `data: [DONE]`). Both are
//! line-oriented, so a single byte-buffering decoder splits the HTTP body at
//! newlines and hands each line to a format-specific parser.
//!
//! Buffering is done on raw bytes so a multi-byte UTF-8 character split
//! across two network chunks is decoded correctly.

use std::fmt::Display;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::{Fragment, Usage};

/// The fragment sequence produced by one generation turn.
///
/// Finite: it ends after a fragment with `done == true` or after the first
/// error. Dropping it closes the upstream connection.
pub type FragmentStream = BoxStream<'static, Result<Fragment, InferenceError>>;

// ─── Line parsers ────────────────────────────────────────────────────────────

/// Turns one line of a streamed body into at most one fragment.
trait LineParser: Send + 'static {
    fn parse_line(&mut self, line: &str) -> Result<Option<Fragment>, InferenceError>;

    /// Called once when the body ends without a terminal fragment.
    fn finish(&mut self) -> Result<Fragment, InferenceError>;
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Ollama `/api/chat` NDJSON lines.
#[derive(Default)]
struct NdjsonParser;

impl LineParser for NdjsonParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<Fragment>, InferenceError> {
        if line.is_empty() {
            return Ok(None);
        }
        parse_ollama_object(line).map(|fragment| {
            if fragment.done || !fragment.text.is_empty() {
                Some(fragment)
            } else {
                None
            }
        })
    }

    fn finish(&mut self) -> Result<Fragment, InferenceError> {
        Err(InferenceError::MalformedResponse {
            reason: "stream ended before the runtime reported completion".into(),
        })
    }
}

/// Parse one Ollama chat object (a streamed line or a buffered body).
pub(crate) fn parse_ollama_object(raw: &str) -> Result<Fragment, InferenceError> {
    let chunk: OllamaChunk =
        serde_json::from_str(raw).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse NDJSON line: {e} (line: {raw})"),
        })?;

    if let Some(error) = chunk.error {
        return Err(InferenceError::UpstreamError {
            status: 500,
            body: error,
        });
    }

    let text = chunk
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();

    let usage = if chunk.prompt_eval_count.is_some() || chunk.eval_count.is_some() {
        Some(Usage {
            prompt_tokens: chunk.prompt_eval_count.unwrap_or(0),
            completion_tokens: chunk.eval_count.unwrap_or(0),
        })
    } else {
        None
    };

    Ok(Fragment {
        text,
        done: chunk.done,
        usage: if chunk.done { usage } else { None },
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible SSE `data:` lines.
///
/// Usage arrives in its own chunk after `finish_reason` when the request
/// sets `stream_options.include_usage`, so it is held until `[DONE]`.
#[derive(Default)]
struct SseParser {
    finish_seen: bool,
    usage: Option<Usage>,
}

impl LineParser for SseParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<Fragment>, InferenceError> {
        let data = match line.strip_prefix("data:") {
            Some(data) => data.trim(),
            // Blank separators, `event:` lines and `:` keep-alive comments.
            None => return Ok(None),
        };

        if data == "[DONE]" {
            return Ok(Some(Fragment::done(self.usage.take())));
        }
        if data.is_empty() {
            return Ok(None);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(data).map_err(|e| InferenceError::MalformedResponse {
                reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
            })?;

        if let Some(error) = chunk.error {
            return Err(InferenceError::UpstreamError {
                status: 500,
                body: error.to_string(),
            });
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if choice.finish_reason.is_some() {
            self.finish_seen = true;
        }

        match choice.delta.content {
            Some(content) if !content.is_empty() => Ok(Some(Fragment::text(content))),
            _ => Ok(None),
        }
    }

    fn finish(&mut self) -> Result<Fragment, InferenceError> {
        // Some servers close the body after finish_reason without `[DONE]`.
        if self.finish_seen {
            Ok(Fragment::done(self.usage.take()))
        } else {
            Err(InferenceError::MalformedResponse {
                reason: "SSE stream ended before a finish_reason".into(),
            })
        }
    }
}

/// Parse a buffered (`stream: false`) OpenAI chat completion body.
pub(crate) fn parse_completion_body(body: &str) -> Result<Fragment, InferenceError> {
    #[derive(Deserialize)]
    struct CompletionBody {
        choices: Vec<CompletionChoice>,
        #[serde(default)]
        usage: Option<Usage>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: CompletionMessage,
    }

    #[derive(Deserialize)]
    struct CompletionMessage {
        #[serde(default)]
        content: Option<String>,
    }

    let resp: CompletionBody =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse completion body: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    Ok(Fragment {
        text: choice.message.content.unwrap_or_default(),
        done: true,
        usage: resp.usage,
    })
}

// ─── Byte-stream decoder ─────────────────────────────────────────────────────

/// Longest line accepted from a runtime before the body is rejected.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

struct DecodeState<S, P> {
    bytes: std::pin::Pin<Box<S>>,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    parser: P,
    endpoint: String,
    eof: bool,
    finished: bool,
}

fn decode_lines<S, B, E, P>(bytes: S, parser: P, endpoint: &str) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
    P: LineParser,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        scanned: 0,
        parser,
        endpoint: endpoint.to_string(),
        eof: false,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            let newline = state.buffer[state.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| state.scanned + i);
            if let Some(pos) = newline {
                state.scanned = 0;
                let line_bytes: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                match state.parser.parse_line(line.trim()) {
                    Ok(Some(fragment)) => {
                        state.finished = fragment.done;
                        return Some((Ok(fragment), state));
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            state.scanned = state.buffer.len();
            if state.buffer.len() > MAX_LINE_BYTES {
                state.finished = true;
                let err = InferenceError::MalformedResponse {
                    reason: format!("line exceeds {MAX_LINE_BYTES} bytes"),
                };
                return Some((Err(err), state));
            }

            if state.eof {
                state.finished = true;
                return Some((state.parser.finish(), state));
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    let err = InferenceError::UpstreamUnavailable {
                        endpoint: state.endpoint.clone(),
                        reason: format!("stream read error: {e}"),
                    };
                    return Some((Err(err), state));
                }
                None => {
                    state.eof = true;
                    // Flush a trailing line that has no newline.
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    })
    .boxed()
}

/// Decode an Ollama NDJSON body into fragments.
pub fn parse_ndjson_stream<S, B, E>(bytes: S, endpoint: &str) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    decode_lines(bytes, NdjsonParser, endpoint)
}

/// Decode an OpenAI-compatible SSE body into fragments.
pub fn parse_sse_stream<S, B, E>(bytes: S, endpoint: &str) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    decode_lines(bytes, SseParser::default(), endpoint)
}

// ─── Idle timeout ────────────────────────────────────────────────────────────

/// Fail the stream with `UpstreamTimeout` when no fragment arrives within
/// `idle`. The inner stream is dropped (closing the connection) on timeout.
pub fn with_idle_timeout(inner: FragmentStream, idle: Duration) -> FragmentStream {
    let duration_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);

    stream::unfold(Some(inner), move |inner| async move {
        let mut inner = inner?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(item)) => {
                let terminal = match &item {
                    Ok(fragment) => fragment.done,
                    Err(_) => true,
                };
                Some((item, if terminal { None } else { Some(inner) }))
            }
            Ok(None) => None,
            Err(_) => {
                tracing::warn!(duration_ms, "runtime stream idle timeout");
                Some((Err(InferenceError::UpstreamTimeout { duration_ms }), None))
            }
        }
    })
    .boxed()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(p.to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<Fragment, InferenceError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_ndjson_fragments_and_usage() {
        let body: &[&[u8]] = &[
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":12,\"eval_count\":2}\n",
        ];
        let out = collect(parse_ndjson_stream(chunks(body), "ollama")).await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap().text, "Hel");
        assert_eq!(out[1].as_ref().unwrap().text, "lo");
        let last = out[2].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(
            last.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 2
            })
        );
    }

    #[tokio::test]
    async fn test_ndjson_line_split_across_chunks() {
        // "é" is two bytes; split it between network chunks.
        let line = "{\"message\":{\"content\":\"caf\u{e9}\"},\"done\":false}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').unwrap() + 1;
        let done = b"{\"done\":true}\n";
        let body: &[&[u8]] = &[&bytes[..split], &bytes[split..], done];

        let out = collect(parse_ndjson_stream(chunks(body), "ollama")).await;
        assert_eq!(out[0].as_ref().unwrap().text, "caf\u{e9}");
        assert!(out[1].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_ndjson_error_line() {
        let body: &[&[u8]] = &[b"{\"error\":\"model 'nope' not found\"}\n"];
        let out = collect(parse_ndjson_stream(chunks(body), "ollama")).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Err(InferenceError::UpstreamError { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_ndjson_truncated_body_is_error() {
        let body: &[&[u8]] = &[b"{\"message\":{\"content\":\"partial\"},\"done\":false}\n"];
        let out = collect(parse_ndjson_stream(chunks(body), "ollama")).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[1],
            Err(InferenceError::MalformedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_sse_content_usage_and_done() {
        let body: &[&[u8]] = &[
            b": keep-alive\n\n",
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"4\"},\"finish_reason\":null}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":20,\"completion_tokens\":1,\"total_tokens\":21}}\n\n",
            b"data: [DONE]\n\n",
        ];
        let out = collect(parse_sse_stream(chunks(body), "vllm")).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().text, "4");
        let last = out[1].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.usage.unwrap().total_tokens(), 21);
    }

    #[tokio::test]
    async fn test_sse_crlf_and_missing_done_after_finish() {
        let body: &[&[u8]] = &[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n\r\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}",
        ];
        let out = collect(parse_sse_stream(chunks(body), "vllm")).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().text, "hi");
        assert!(out[1].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_sse_invalid_json_stops_stream() {
        let body: &[&[u8]] = &[b"data: {not json}\n\n", b"data: [DONE]\n\n"];
        let out = collect(parse_sse_stream(chunks(body), "vllm")).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }

    #[tokio::test]
    async fn test_read_error_maps_to_unavailable() {
        let body = stream::iter(vec![
            Ok(b"{\"message\":{\"content\":\"a\"},\"done\":false}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let out = collect(parse_ndjson_stream(body, "http://localhost:11434")).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[1],
            Err(InferenceError::UpstreamUnavailable { endpoint, .. }) if endpoint == "http://localhost:11434"
        ));
    }

    #[tokio::test]
    async fn test_line_assembled_from_many_small_chunks() {
        let line = format!(
            "{{\"message\":{{\"content\":\"{}\"}},\"done\":false}}\n{{\"done\":true}}\n",
            "a".repeat(10_000)
        );
        let body = stream::iter(
            line.as_bytes()
                .chunks(7)
                .map(|c| Ok::<_, std::io::Error>(c.to_vec()))
                .collect::<Vec<_>>(),
        );
        let out = collect(parse_ndjson_stream(body, "ollama")).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().text.len(), 10_000);
        assert!(out[1].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_unterminated_line_over_limit_rejected() {
        let block = vec![b'x'; 64 * 1024];
        let blocks = MAX_LINE_BYTES / block.len() + 2;
        let body = stream::iter(
            (0..blocks)
                .map(|_| Ok::<_, std::io::Error>(block.clone()))
                .collect::<Vec<_>>(),
        );
        let out = collect(parse_sse_stream(body, "vllm")).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            Err(InferenceError::MalformedResponse { reason }) if reason.contains("exceeds")
        ));
    }

    #[test]
    fn test_parse_completion_body() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }"#;
        let fragment = parse_completion_body(body).unwrap();
        assert_eq!(fragment.text, "Hello!");
        assert!(fragment.done);
        assert_eq!(fragment.usage.unwrap().prompt_tokens, 5);
    }

    #[test]
    fn test_parse_completion_body_empty_choices() {
        assert!(parse_completion_body(r#"{"choices": []}"#).is_err());
    }

    #[tokio::test]
    async fn test_idle_timeout_fires() {
        let stalled: FragmentStream = stream::pending().boxed();
        let out = collect(with_idle_timeout(stalled, Duration::from_millis(20))).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Err(InferenceError::UpstreamTimeout { duration_ms: 20 })
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout_passes_through() {
        let inner: FragmentStream = stream::iter(vec![
            Ok(Fragment::text("a")),
            Ok(Fragment::done(None)),
            Ok(Fragment::text("ignored after done")),
        ])
        .boxed();
        let out = collect(with_idle_timeout(inner, Duration::from_secs(1))).await;
        assert_eq!(out.len(), 2);
    }
}
