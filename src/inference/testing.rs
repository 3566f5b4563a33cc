//! Scripted in-memory runtime for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;

use super::client::ModelRuntimeClient;
use super::errors::InferenceError;
use super::streaming::FragmentStream;
use super::types::{Fragment, GenerateRequest, Usage};

/// What one `generate` call does.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Yield these fragments, then a terminal fragment with `usage`.
    Fragments(Vec<String>, Option<Usage>),
    /// `generate` itself fails as if the runtime were down.
    FailConnect,
    /// `generate` succeeds but the first fragment is a connection error.
    FailFirstFragment,
    /// Yield these fragments, then never finish.
    Stall(Vec<String>),
}

impl Script {
    pub(crate) fn text(parts: &[&str]) -> Self {
        Script::Fragments(parts.iter().map(|s| s.to_string()).collect(), None)
    }

    pub(crate) fn with_usage(parts: &[&str], prompt: u32, completion: u32) -> Self {
        Script::Fragments(
            parts.iter().map(|s| s.to_string()).collect(),
            Some(Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
            }),
        )
    }
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Plays back one `Script` per `generate` call and records every request.
pub(crate) struct ScriptedRuntime {
    scripts: Mutex<VecDeque<Script>>,
    /// Replayed forever once the queue is empty.
    fallback: Script,
    fragment_delay: Option<Duration>,
    pub(crate) requests: Mutex<Vec<GenerateRequest>>,
    pub(crate) unloaded: Mutex<Vec<String>>,
    pub(crate) streams_dropped: Arc<AtomicUsize>,
    /// Fragments handed to a consumer so far, across all calls.
    pub(crate) fragments_pulled: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub(crate) fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self::build(scripts, Script::text(&[]), None))
    }

    /// Every call plays `script`.
    pub(crate) fn repeating(script: Script) -> Arc<Self> {
        Arc::new(Self::build(Vec::new(), script, None))
    }

    pub(crate) fn with_delay(scripts: Vec<Script>, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(scripts, Script::text(&[]), Some(delay)))
    }

    fn build(scripts: Vec<Script>, fallback: Script, fragment_delay: Option<Duration>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            fragment_delay,
            requests: Mutex::new(Vec::new()),
            unloaded: Mutex::new(Vec::new()),
            streams_dropped: Arc::new(AtomicUsize::new(0)),
            fragments_pulled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn request(&self, index: usize) -> GenerateRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    fn unavailable() -> InferenceError {
        InferenceError::UpstreamUnavailable {
            endpoint: "scripted".into(),
            reason: "connection refused".into(),
        }
    }
}

impl ModelRuntimeClient for ScriptedRuntime {
    fn endpoint(&self) -> &str {
        "scripted"
    }

    fn generate(
        &self,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<FragmentStream, InferenceError>> {
        let stream_mode = request.stream;
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let delay = self.fragment_delay;
        let guard = DropCounter(Arc::clone(&self.streams_dropped));
        let pulled = Arc::clone(&self.fragments_pulled);

        async move {
            let items: Vec<Result<Fragment, InferenceError>> = match script {
                Script::FailConnect => return Err(Self::unavailable()),
                Script::FailFirstFragment => vec![Err(Self::unavailable())],
                Script::Fragments(parts, usage) if stream_mode => parts
                    .into_iter()
                    .map(|p| Ok(Fragment::text(p)))
                    .chain(std::iter::once(Ok(Fragment::done(usage))))
                    .collect(),
                Script::Fragments(parts, usage) => vec![Ok(Fragment {
                    text: parts.concat(),
                    done: true,
                    usage,
                })],
                Script::Stall(parts) => {
                    let head = stream::iter(parts.into_iter().map(|p| Ok(Fragment::text(p))));
                    let stream = head.chain(stream::pending()).map(move |item| {
                        let _ = &guard;
                        pulled.fetch_add(1, Ordering::SeqCst);
                        item
                    });
                    return Ok(stream.boxed());
                }
            };

            let stream = stream::iter(items)
                .then(move |item| async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    item
                })
                .map(move |item| {
                    let _ = &guard;
                    pulled.fetch_add(1, Ordering::SeqCst);
                    item
                });
            Ok(stream.boxed())
        }
        .boxed()
    }

    fn unload<'a>(&'a self, model_path: &'a str) -> BoxFuture<'a, Result<(), InferenceError>> {
        self.unloaded.lock().unwrap().push(model_path.to_string());
        async { Ok(()) }.boxed()
    }
}
