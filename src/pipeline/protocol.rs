//! OpenAI chat-completion request and response shapes.
//!
//! Field order in the response structs is the wire order.

use serde::{Deserialize, Serialize};

use crate::inference::types::{GenerationOptions, Message, Usage};
use crate::tools::registry::ToolDefinition;

// ─── Request ─────────────────────────────────────────────────────────────────

/// A validated chat-completion request, as handed over by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub options: GenerationOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(model: &str, messages: Vec<Message>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            options: GenerationOptions::default(),
            tools: Vec::new(),
            stream: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

// ─── Aggregate response ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: UsageBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBlock {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl From<Usage> for UsageBlock {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens(),
        }
    }
}

impl ChatCompletion {
    pub fn new(id: &str, created: i64, model: &str, content: String, usage: Usage) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion".into(),
            created,
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".into(),
                    content,
                },
                finish_reason: "stop".into(),
            }],
            usage: usage.into(),
        }
    }

    /// The assistant content of the first choice.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

// ─── Streaming chunks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    /// Serialized as `null` until the terminal chunk.
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_openai_body() {
        let body = r#"{
            "model": "m1",
            "messages": [{"role": "user", "content": "2+2?"}],
            "temperature": 0.1,
            "max_tokens": 32,
            "stop": "\n\n",
            "tools": [{"type": "function", "function": {"name": "calculator", "description": "math", "parameters": {}}}],
            "stream": true
        }"#;
        let req: CompletionRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.model, "m1");
        assert_eq!(req.options.temperature, Some(0.1));
        assert_eq!(req.options.max_tokens, Some(32));
        assert_eq!(req.options.stop, vec!["\n\n".to_string()]);
        assert_eq!(req.tools[0].name, "calculator");
        assert!(req.stream);
    }

    #[test]
    fn test_request_defaults() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"model":"m1","messages":[]}"#).unwrap();
        assert!(!req.stream);
        assert!(req.tools.is_empty());
        assert_eq!(req.options, GenerationOptions::default());
    }

    #[test]
    fn test_completion_wire_shape() {
        let completion = ChatCompletion::new(
            "chatcmpl-1",
            1_700_000_000,
            "m1",
            "4".into(),
            Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
            },
        );
        assert_eq!(
            serde_json::to_string(&completion).unwrap(),
            r#"{"id":"chatcmpl-1","object":"chat.completion","created":1700000000,"model":"m1","choices":[{"index":0,"message":{"role":"assistant","content":"4"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#
        );
        assert_eq!(completion.content(), "4");
    }
}
