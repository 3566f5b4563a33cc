//! Model runtime clients.
//!
//! `ModelRuntimeClient` is the seam between the relay and a backend inference
//! engine. Two HTTP implementations ship with the crate: `OllamaClient`
//! (`/api/chat`, NDJSON) and `OpenAiCompatClient` (`/v1/chat/completions`,
//! SSE) for vLLM and any other OpenAI-compatible server. `RuntimeSet` maps a
//! `ModelConfig` to the client that serves it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use super::config::{ModelConfig, Provider, RelayConfig};
use super::errors::InferenceError;
use super::streaming::{
    parse_completion_body, parse_ndjson_stream, parse_ollama_object, parse_sse_stream,
    FragmentStream,
};
use super::types::{GenerateRequest, Message, Role};

// ─── Trait ───────────────────────────────────────────────────────────────────

/// A backend inference engine.
///
/// `generate` resolves once the runtime has accepted the request; the returned
/// stream then yields fragments as they arrive. The stream is finite and not
/// restartable. Dropping it abandons the generation upstream.
pub trait ModelRuntimeClient: Send + Sync {
    /// Endpoint used in logs and error messages.
    fn endpoint(&self) -> &str;

    fn generate(&self, request: GenerateRequest)
        -> BoxFuture<'_, Result<FragmentStream, InferenceError>>;

    /// Best-effort release of runtime-side resources for an evicted model.
    fn unload<'a>(&'a self, _model_path: &'a str) -> BoxFuture<'a, Result<(), InferenceError>> {
        async { Ok(()) }.boxed()
    }

    /// Whether the runtime answers at all.
    fn health_check(&self) -> BoxFuture<'_, bool> {
        async { true }.boxed()
    }

    /// Models the runtime reports as installed.
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelConfig>, InferenceError>> {
        async { Ok(Vec::new()) }.boxed()
    }
}

fn build_http(base_url: &str, connect_timeout: Duration) -> Result<HttpClient, InferenceError> {
    // No total timeout: generations are long-lived. Idle time between
    // fragments is bounded by the pipeline.
    HttpClient::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| InferenceError::UpstreamUnavailable {
            endpoint: base_url.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(InferenceError::UpstreamError {
        status: status.as_u16(),
        body,
    })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── Ollama ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions<'a> {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

/// Client for an Ollama server.
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    connect_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, InferenceError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http: build_http(&base_url, connect_timeout)?,
            base_url,
            connect_timeout,
        })
    }

    fn chat_body(request: &GenerateRequest) -> OllamaChatRequest<'_> {
        OllamaChatRequest {
            model: &request.model_path,
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: ollama_role(m.role),
                    content: &m.content,
                    name: m.name.as_deref(),
                })
                .collect(),
            stream: request.stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                top_p: request.top_p,
                stop: &request.stop,
            },
        }
    }

    async fn send_chat(&self, request: GenerateRequest) -> Result<FragmentStream, InferenceError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::chat_body(&request);

        tracing::debug!(
            url = %url,
            model = %request.model_path,
            message_count = request.messages.len(),
            stream = request.stream,
            "ollama chat request"
        );

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::from_send(&self.base_url, &e, duration_ms(self.connect_timeout)))?;
        let response = check_status(response).await?;

        if request.stream {
            return Ok(parse_ndjson_stream(response.bytes_stream(), &self.base_url));
        }

        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::UpstreamUnavailable {
                endpoint: self.base_url.clone(),
                reason: format!("failed to read response body: {e}"),
            })?;
        let mut fragment = parse_ollama_object(&text)?;
        fragment.done = true;
        Ok(stream::once(async move { Ok(fragment) }).boxed())
    }
}

/// Ollama has no `function` role; tool results go in as `tool`.
fn ollama_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Function => "tool",
    }
}

impl ModelRuntimeClient for OllamaClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn generate(
        &self,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<FragmentStream, InferenceError>> {
        self.send_chat(request).boxed()
    }

    fn unload<'a>(&'a self, model_path: &'a str) -> BoxFuture<'a, Result<(), InferenceError>> {
        async move {
            let url = format!("{}/api/generate", self.base_url);
            let body = serde_json::json!({ "model": model_path, "keep_alive": 0 });
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| InferenceError::from_send(&self.base_url, &e, duration_ms(self.connect_timeout)))?;
            check_status(response).await?;
            tracing::info!(model = %model_path, "ollama model unloaded");
            Ok(())
        }
        .boxed()
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        async move {
            let url = format!("{}/api/tags", self.base_url);
            match self.http.get(&url).timeout(self.connect_timeout).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            }
        }
        .boxed()
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelConfig>, InferenceError>> {
        async move {
            let url = format!("{}/api/tags", self.base_url);
            let response = self
                .http
                .get(&url)
                .timeout(self.connect_timeout)
                .send()
                .await
                .map_err(|e| InferenceError::from_send(&self.base_url, &e, duration_ms(self.connect_timeout)))?;
            let tags: OllamaTags = check_status(response).await?.json().await.map_err(|e| {
                InferenceError::MalformedResponse {
                    reason: format!("failed to parse /api/tags: {e}"),
                }
            })?;
            Ok(tags
                .models
                .iter()
                .map(|t| ModelConfig::discovered(&t.name, Provider::Ollama, &t.name))
                .collect())
        }
        .boxed()
    }
}

// ─── OpenAI-compatible (vLLM, other) ─────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Client for vLLM and other OpenAI-compatible servers.
pub struct OpenAiCompatClient {
    http: HttpClient,
    base_url: String,
    provider: Provider,
    connect_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        provider: Provider,
        connect_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http: build_http(&base_url, connect_timeout)?,
            base_url,
            provider,
            connect_timeout,
        })
    }

    /// `base_url` may or may not already end in `/v1`.
    fn api_url(&self, path: &str) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/v1{path}", self.base_url)
        }
    }

    fn chat_body(request: &GenerateRequest) -> ChatCompletionRequest<'_> {
        ChatCompletionRequest {
            model: &request.model_path,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: &request.stop,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send_chat(&self, request: GenerateRequest) -> Result<FragmentStream, InferenceError> {
        let url = self.api_url("/chat/completions");
        let body = Self::chat_body(&request);

        tracing::debug!(
            url = %url,
            model = %request.model_path,
            message_count = request.messages.len(),
            stream = request.stream,
            "chat completion request"
        );

        let mut builder = self.http.post(&url).json(&body);
        if request.stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        let response = builder
            .send()
            .await
            .map_err(|e| InferenceError::from_send(&self.base_url, &e, duration_ms(self.connect_timeout)))?;
        let response = check_status(response).await?;

        if request.stream {
            return Ok(parse_sse_stream(response.bytes_stream(), &self.base_url));
        }

        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::UpstreamUnavailable {
                endpoint: self.base_url.clone(),
                reason: format!("failed to read response body: {e}"),
            })?;
        let fragment = parse_completion_body(&text)?;
        Ok(stream::once(async move { Ok(fragment) }).boxed())
    }
}

impl ModelRuntimeClient for OpenAiCompatClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn generate(
        &self,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<FragmentStream, InferenceError>> {
        self.send_chat(request).boxed()
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        async move {
            let url = self.api_url("/models");
            match self.http.get(&url).timeout(self.connect_timeout).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            }
        }
        .boxed()
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelConfig>, InferenceError>> {
        async move {
            let url = self.api_url("/models");
            let response = self
                .http
                .get(&url)
                .timeout(self.connect_timeout)
                .send()
                .await
                .map_err(|e| InferenceError::from_send(&self.base_url, &e, duration_ms(self.connect_timeout)))?;
            let list: ModelList = check_status(response).await?.json().await.map_err(|e| {
                InferenceError::MalformedResponse {
                    reason: format!("failed to parse /v1/models: {e}"),
                }
            })?;
            Ok(list
                .data
                .iter()
                .map(|m| ModelConfig::discovered(&m.id, self.provider, &m.id))
                .collect())
        }
        .boxed()
    }
}

// ─── RuntimeSet ──────────────────────────────────────────────────────────────

/// Shared client handles, one per runtime endpoint.
#[derive(Clone, Default)]
pub struct RuntimeSet {
    by_provider: HashMap<Provider, Arc<dyn ModelRuntimeClient>>,
    by_endpoint: HashMap<String, Arc<dyn ModelRuntimeClient>>,
}

impl RuntimeSet {
    /// Build HTTP clients for the configured runtimes and every model-level
    /// `base_url` override.
    pub fn from_config(config: &RelayConfig) -> Result<Self, InferenceError> {
        let connect_timeout = Duration::from_secs(config.runtimes.connect_timeout_secs);
        let mut set = Self::default();

        set.by_provider.insert(
            Provider::Ollama,
            Arc::new(OllamaClient::new(
                &config.runtimes.ollama.base_url,
                connect_timeout,
            )?),
        );
        set.by_provider.insert(
            Provider::Vllm,
            Arc::new(OpenAiCompatClient::new(
                &config.runtimes.vllm.base_url,
                Provider::Vllm,
                connect_timeout,
            )?),
        );

        for model in config.models.values() {
            let Some(url) = model.base_url.as_deref() else {
                continue;
            };
            if set.by_endpoint.contains_key(url) {
                continue;
            }
            let client: Arc<dyn ModelRuntimeClient> = match model.provider {
                Provider::Ollama => Arc::new(OllamaClient::new(url, connect_timeout)?),
                provider => Arc::new(OpenAiCompatClient::new(url, provider, connect_timeout)?),
            };
            set.by_endpoint.insert(url.to_string(), client);
        }

        Ok(set)
    }

    /// Route every provider to one client.
    pub fn uniform(client: Arc<dyn ModelRuntimeClient>) -> Self {
        let mut set = Self::default();
        for provider in [Provider::Ollama, Provider::Vllm, Provider::Other] {
            set.by_provider.insert(provider, Arc::clone(&client));
        }
        set
    }

    /// Register (or replace) the client serving one provider.
    pub fn with_provider(mut self, provider: Provider, client: Arc<dyn ModelRuntimeClient>) -> Self {
        self.by_provider.insert(provider, client);
        self
    }

    /// The client that serves `model`.
    pub fn client_for(
        &self,
        model: &ModelConfig,
    ) -> Result<Arc<dyn ModelRuntimeClient>, InferenceError> {
        let client = match model.base_url.as_deref() {
            Some(url) => self
                .by_endpoint
                .get(url)
                .or_else(|| self.by_provider.get(&model.provider)),
            None => self.by_provider.get(&model.provider),
        };
        client.cloned().ok_or_else(|| InferenceError::ConfigError {
            reason: format!(
                "no runtime client for model '{}' ({:?})",
                model.name, model.provider
            ),
        })
    }

    /// Ask each provider-level runtime for its installed models.
    ///
    /// Unreachable runtimes are logged and skipped.
    pub async fn discover(&self) -> Vec<ModelConfig> {
        let mut found = Vec::new();
        for (provider, client) in &self.by_provider {
            match client.list_models().await {
                Ok(models) => {
                    tracing::info!(
                        provider = ?provider,
                        endpoint = %client.endpoint(),
                        count = models.len(),
                        "discovered runtime models"
                    );
                    found.extend(models);
                }
                Err(e) => {
                    tracing::warn!(provider = ?provider, error = %e, "model discovery failed");
                }
            }
        }
        found
    }

    /// Probe every runtime once. Returns `(provider or endpoint, reachable)`
    /// sorted by label.
    pub async fn health(&self) -> Vec<(String, bool)> {
        let mut targets: Vec<(String, Arc<dyn ModelRuntimeClient>)> = self
            .by_provider
            .iter()
            .map(|(provider, client)| (format!("{provider:?}").to_lowercase(), Arc::clone(client)))
            .chain(
                self.by_endpoint
                    .iter()
                    .map(|(url, client)| (url.clone(), Arc::clone(client))),
            )
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = Vec::with_capacity(targets.len());
        for (label, client) in targets {
            let healthy = client.health_check().await;
            tracing::debug!(runtime = %label, endpoint = %client.endpoint(), healthy, "runtime health");
            report.push((label, healthy));
        }
        report
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
