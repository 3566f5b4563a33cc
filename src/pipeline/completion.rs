//! Request orchestration: one chat-completion request in, an aggregate
//! response or a sequence of SSE frames out.
//!
//! A request walks `Pending → Generating ⇄ ToolPending → Finalizing → Done`
//! (or `Errored`). Each generation turn streams through a `DirectiveFilter`
//! so tool-call directives never reach the client; completed directives
//! are executed and their results appended before the next turn. The
//! model instance stays pinned for the whole exchange.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::errors::PipelineError;
use super::protocol::{ChatCompletion, CompletionRequest};
use super::sse::{SseFramer, DONE_FRAME};
use crate::cache::ModelCache;
use crate::inference::config::{ModelConfig, PipelineConfig};
use crate::inference::streaming::with_idle_timeout;
use crate::inference::tokens::{estimate_prompt_tokens, estimate_tokens};
use crate::inference::types::{GenerateRequest, GenerationOptions, Message, Usage};
use crate::tools::invoker::{tool_prompt, ToolInvoker};
use crate::tools::parser::DirectiveFilter;
use crate::tools::registry::{ToolDefinition, ToolRegistry};

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Generating,
    ToolPending,
    Finalizing,
    Done,
    Errored,
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Tool rounds executed before further calls are ignored.
    pub max_tool_rounds: usize,
    pub request_timeout: Duration,
    pub fragment_timeout: Duration,
    pub stream_buffer: usize,
    pub inject_tool_prompt: bool,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_tool_rounds: config.max_tool_rounds,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            fragment_timeout: Duration::from_secs(config.fragment_timeout_secs),
            stream_buffer: config.stream_buffer.max(1),
            inject_tool_prompt: config.inject_tool_prompt,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

/// A finished non-streaming exchange.
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: ChatCompletion,
    /// Request messages followed by everything the exchange appended.
    pub transcript: Vec<Message>,
    /// Every state the exchange passed through, in order.
    pub states: Vec<PipelineState>,
    pub tool_rounds: usize,
}

pub enum CompletionOutput {
    Aggregate(Completion),
    Stream(CompletionStream),
}

// ─── Internals ───────────────────────────────────────────────────────────────

/// A request that passed validation, with options resolved against the
/// model config.
struct Prepared {
    id: String,
    created: i64,
    config: ModelConfig,
    messages: Vec<Message>,
    /// Empty when the request declared none or the model cannot use them.
    tools: Vec<ToolDefinition>,
    options: GenerationOptions,
    upstream_stream: bool,
}

impl Prepared {
    fn generate_request(&self, messages: Vec<Message>) -> GenerateRequest {
        GenerateRequest {
            model_path: self.config.path.clone(),
            messages,
            temperature: self.options.temperature.unwrap_or(self.config.temperature),
            max_tokens: self.options.max_tokens.unwrap_or(self.config.max_tokens),
            top_p: self.options.top_p,
            stop: self.options.stop.clone(),
            stream: self.upstream_stream,
        }
    }
}

/// Mutable record of one exchange.
struct Exchange {
    transcript: Vec<Message>,
    states: Vec<PipelineState>,
    content: String,
    usage: Usage,
    turns: usize,
    tool_rounds: usize,
}

impl Exchange {
    fn new(messages: Vec<Message>) -> Self {
        Self {
            transcript: messages,
            states: vec![PipelineState::Pending],
            content: String::new(),
            usage: Usage::default(),
            turns: 0,
            tool_rounds: 0,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        tracing::debug!(?state, turn = self.turns, "pipeline state");
        self.states.push(state);
    }

    async fn emit(&mut self, sink: &Sink, text: &str) -> Result<(), PipelineError> {
        if text.is_empty() {
            return Ok(());
        }
        self.content.push_str(text);
        sink.content(text).await
    }
}

/// Where visible text goes as it is produced.
enum Sink {
    /// Non-streaming: text is only accumulated in the `Exchange`.
    Aggregate,
    Frames {
        tx: mpsc::Sender<String>,
        framer: SseFramer,
    },
}

impl Sink {
    async fn content(&self, text: &str) -> Result<(), PipelineError> {
        match self {
            Sink::Aggregate => Ok(()),
            Sink::Frames { tx, framer } => tx
                .send(framer.content(text))
                .await
                .map_err(|_| PipelineError::ClientGone),
        }
    }

    async fn finish(&self) -> Result<(), PipelineError> {
        match self {
            Sink::Aggregate => Ok(()),
            Sink::Frames { tx, framer } => tx
                .send(framer.stop())
                .await
                .map_err(|_| PipelineError::ClientGone),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn check_tool_names(tools: &[ToolDefinition]) -> Result<(), PipelineError> {
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.name.trim().is_empty() {
            return Err(PipelineError::InvalidRequest {
                reason: "tool name must not be empty".into(),
            });
        }
        if !seen.insert(tool.name.as_str()) {
            return Err(PipelineError::InvalidRequest {
                reason: format!("duplicate tool name: {}", tool.name),
            });
        }
    }
    Ok(())
}

// ─── CompletionPipeline ──────────────────────────────────────────────────────

/// Shared handle to the pipeline. Cloning is cheap.
#[derive(Clone)]
pub struct CompletionPipeline {
    cache: ModelCache,
    invoker: ToolInvoker,
    settings: Arc<PipelineSettings>,
}

impl CompletionPipeline {
    pub fn new(cache: ModelCache, invoker: ToolInvoker, settings: PipelineSettings) -> Self {
        Self {
            cache,
            invoker,
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(cache: ModelCache, tools: ToolRegistry, config: &PipelineConfig) -> Self {
        let invoker = ToolInvoker::new(
            Arc::new(tools),
            Duration::from_secs(config.tool_timeout_secs),
            config.max_tool_result_chars,
        );
        Self::new(cache, invoker, PipelineSettings::from(config))
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    /// Serve a request in the mode it asks for.
    pub async fn run(&self, request: CompletionRequest) -> Result<CompletionOutput, PipelineError> {
        if request.stream {
            self.stream(request).map(CompletionOutput::Stream)
        } else {
            self.complete(request).await.map(CompletionOutput::Aggregate)
        }
    }

    /// Run a request to completion and return the aggregate response.
    pub async fn complete(&self, request: CompletionRequest) -> Result<Completion, PipelineError> {
        let started = Instant::now();
        let prepared = self.prepare(request)?;
        let mut exchange = Exchange::new(prepared.messages.clone());

        match self
            .drive_bounded(&prepared, &Sink::Aggregate, &mut exchange)
            .await
        {
            Ok(()) => {
                exchange.enter(PipelineState::Done);
                log_finished(&prepared, &exchange, started);
                let response = ChatCompletion::new(
                    &prepared.id,
                    prepared.created,
                    &prepared.config.name,
                    exchange.content,
                    exchange.usage,
                );
                Ok(Completion {
                    response,
                    transcript: exchange.transcript,
                    states: exchange.states,
                    tool_rounds: exchange.tool_rounds,
                })
            }
            Err(e) => {
                exchange.enter(PipelineState::Errored);
                tracing::error!(request_id = %prepared.id, model = %prepared.config.name, error = %e, "completion failed");
                Err(e)
            }
        }
    }

    /// Start a streamed exchange.
    ///
    /// Validation errors are returned before any frame exists. Afterwards
    /// every failure is reported in-stream. Generation runs on its own task
    /// and is cancelled when the returned stream is dropped. Must be called
    /// from within a Tokio runtime.
    pub fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, PipelineError> {
        let prepared = self.prepare(request)?;
        let framer = SseFramer::new(&prepared.id, prepared.created, &prepared.config.name);
        let (tx, rx) = mpsc::channel(self.settings.stream_buffer.max(1));

        let pipeline = self.clone();
        let task_framer = framer.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut exchange = Exchange::new(prepared.messages.clone());
            let sink = Sink::Frames {
                tx: tx.clone(),
                framer: task_framer.clone(),
            };

            match pipeline.drive_bounded(&prepared, &sink, &mut exchange).await {
                Ok(()) => {
                    exchange.enter(PipelineState::Done);
                    let _ = tx.send(DONE_FRAME.to_string()).await;
                    log_finished(&prepared, &exchange, started);
                }
                Err(PipelineError::ClientGone) => {
                    exchange.enter(PipelineState::Errored);
                    tracing::warn!(request_id = %prepared.id, "client disconnected, generation cancelled");
                }
                Err(e) => {
                    exchange.enter(PipelineState::Errored);
                    tracing::error!(request_id = %prepared.id, model = %prepared.config.name, error = %e, "streamed completion failed");
                    let _ = tx.send(task_framer.error(&e)).await;
                    let _ = tx.send(DONE_FRAME.to_string()).await;
                }
            }
        });

        Ok(CompletionStream::new(rx, task, framer))
    }

    fn prepare(&self, request: CompletionRequest) -> Result<Prepared, PipelineError> {
        let config = self.cache.resolve(&request.model)?.clone();
        if config.is_embedding_model {
            return Err(PipelineError::InvalidRequest {
                reason: format!("{} is an embedding model", config.name),
            });
        }
        if request.messages.is_empty() {
            return Err(PipelineError::InvalidRequest {
                reason: "messages must not be empty".into(),
            });
        }
        check_tool_names(&request.tools)?;

        let tools = if config.supports_tools {
            request.tools
        } else {
            if !request.tools.is_empty() {
                tracing::debug!(model = %config.name, "model does not support tools, ignoring declared tools");
            }
            Vec::new()
        };
        let upstream_stream = request.stream && config.supports_streaming;

        let prepared = Prepared {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            messages: request.messages,
            tools,
            options: request.options,
            upstream_stream,
            config,
        };
        tracing::info!(
            request_id = %prepared.id,
            model = %prepared.config.name,
            stream = request.stream,
            upstream_stream,
            tools = prepared.tools.len(),
            messages = prepared.messages.len(),
            "completion request"
        );
        Ok(prepared)
    }

    async fn drive_bounded(
        &self,
        prepared: &Prepared,
        sink: &Sink,
        exchange: &mut Exchange,
    ) -> Result<(), PipelineError> {
        let limit = self.settings.request_timeout;
        match tokio::time::timeout(limit, self.drive(prepared, sink, exchange)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::UpstreamTimeout {
                duration_ms: duration_ms(limit),
            }),
        }
    }

    async fn drive(
        &self,
        prepared: &Prepared,
        sink: &Sink,
        exchange: &mut Exchange,
    ) -> Result<(), PipelineError> {
        let lease = self.cache.acquire(&prepared.config.name).await?;
        let client = Arc::clone(lease.client());
        let tools_enabled = !prepared.tools.is_empty();
        let preamble = (tools_enabled && self.settings.inject_tool_prompt)
            .then(|| Message::system(tool_prompt(&prepared.tools)));
        let idle = self.settings.fragment_timeout;

        loop {
            exchange.enter(PipelineState::Generating);
            exchange.turns += 1;

            // The tool prompt goes to the runtime only, never into the transcript.
            let mut input = Vec::with_capacity(exchange.transcript.len() + 1);
            input.extend(preamble.iter().cloned());
            input.extend(exchange.transcript.iter().cloned());
            let prompt_estimate = estimate_prompt_tokens(&input);

            let fragments = tokio::time::timeout(idle, client.generate(prepared.generate_request(input)))
                .await
                .map_err(|_| PipelineError::UpstreamTimeout {
                    duration_ms: duration_ms(idle),
                })??;
            let mut fragments = with_idle_timeout(fragments, idle);

            let mut filter = tools_enabled.then(DirectiveFilter::new);
            let mut raw = String::new();
            let mut reported = None;
            while let Some(fragment) = fragments.next().await {
                let fragment = fragment?;
                raw.push_str(&fragment.text);
                let visible = match filter.as_mut() {
                    Some(filter) => filter.push(&fragment.text),
                    None => fragment.text,
                };
                exchange.emit(sink, &visible).await?;
                if fragment.done {
                    reported = fragment.usage;
                    break;
                }
            }
            drop(fragments);

            let calls = match filter.as_mut() {
                Some(filter) => {
                    let tail = filter.finish();
                    exchange.emit(sink, &tail).await?;
                    filter.take_calls()
                }
                None => Vec::new(),
            };

            exchange.usage.accumulate(reported.unwrap_or_else(|| Usage {
                prompt_tokens: prompt_estimate,
                completion_tokens: estimate_tokens(&raw),
            }));
            exchange.transcript.push(Message::assistant(raw));

            if calls.is_empty() {
                break;
            }
            if exchange.tool_rounds >= self.settings.max_tool_rounds {
                tracing::warn!(
                    request_id = %prepared.id,
                    rounds = exchange.tool_rounds,
                    ignored = calls.len(),
                    "tool round limit reached, finalizing"
                );
                break;
            }

            exchange.enter(PipelineState::ToolPending);
            exchange.tool_rounds += 1;
            for call in &calls {
                let message = self.invoker.invoke(call, &prepared.tools).await;
                exchange.transcript.push(message);
            }
        }

        exchange.enter(PipelineState::Finalizing);
        sink.finish().await?;
        drop(lease);
        Ok(())
    }
}

fn log_finished(prepared: &Prepared, exchange: &Exchange, started: Instant) {
    tracing::info!(
        request_id = %prepared.id,
        model = %prepared.config.name,
        turns = exchange.turns,
        tool_rounds = exchange.tool_rounds,
        prompt_tokens = exchange.usage.prompt_tokens,
        completion_tokens = exchange.usage.completion_tokens,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "completion finished"
    );
}

// ─── CompletionStream ────────────────────────────────────────────────────────

/// SSE frames of a streamed exchange.
///
/// Always ends with `data: [DONE]`. If the generation task dies without
/// sending it, an error frame and the sentinel are synthesized. Dropping the
/// stream cancels generation and releases the model pin.
pub struct CompletionStream {
    frames: mpsc::Receiver<String>,
    task: JoinHandle<()>,
    framer: SseFramer,
    pending: VecDeque<String>,
    saw_done: bool,
    closed: bool,
}

impl CompletionStream {
    fn new(frames: mpsc::Receiver<String>, task: JoinHandle<()>, framer: SseFramer) -> Self {
        Self {
            frames,
            task,
            framer,
            pending: VecDeque::new(),
            saw_done: false,
            closed: false,
        }
    }
}

impl Stream for CompletionStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = &mut *self;
        if let Some(frame) = this.pending.pop_front() {
            return Poll::Ready(Some(frame));
        }
        if this.closed {
            return Poll::Ready(None);
        }

        match this.frames.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if frame == DONE_FRAME {
                    this.saw_done = true;
                }
                Poll::Ready(Some(frame))
            }
            Poll::Ready(None) => {
                this.closed = true;
                if this.saw_done {
                    return Poll::Ready(None);
                }
                tracing::error!("generation task ended without a terminal frame");
                this.saw_done = true;
                this.pending.push_back(DONE_FRAME.to_string());
                let err = PipelineError::UpstreamError {
                    reason: "generation ended unexpectedly".into(),
                };
                Poll::Ready(Some(this.framer.error(&err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
