//! Shared types for the inference layer.
//!
//! `Message` and `Role` are the conversation types the whole crate speaks;
//! `Fragment` and `Usage` are what runtime clients yield during generation.

use serde::{Deserialize, Serialize};

// ─── Conversation Types ──────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Tool results fed back to the model.
    Function,
}

/// A single message in the conversation.
///
/// A conversation is an ordered `Vec<Message>` that only ever grows by
/// appending; history is never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Tool name for `function` messages, optional author name otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A tool result, named after the tool that produced it.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: content.into(),
            name: Some(name.into()),
        }
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

// ─── Generation Options ──────────────────────────────────────────────────────

/// Per-request sampling options.
///
/// Unset values fall back to the model config defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// OpenAI accepts a single string or a list.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "string_or_seq"
    )]
    pub stop: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(stop)) => vec![stop],
        Some(OneOrMany::Many(stops)) => stops,
        None => Vec::new(),
    })
}

/// Everything a runtime client needs for one generation turn.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Runtime-side model identifier (`ModelConfig::path`).
    pub model_path: String,
    pub messages: Vec<Message>,
    /// Resolved temperature (request override or model default).
    pub temperature: f32,
    /// Resolved completion budget.
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    /// `true` → incremental fragments; `false` → one buffered fragment.
    pub stream: bool,
}

// ─── Fragments ───────────────────────────────────────────────────────────────

/// Token counters reported by the runtime for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Add another turn's counters to this one.
    pub fn accumulate(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One incremental piece of generated text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub text: String,
    /// Set on the terminal fragment only.
    pub done: bool,
    /// Usually only present on the terminal fragment.
    pub usage: Option<Usage>,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
            usage: None,
        }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self {
            text: String::new(),
            done: true,
            usage,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
