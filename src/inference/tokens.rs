//! Token estimation for usage fallback.
//!
//! Runtimes that omit usage counters (some OpenAI-compatible servers ignore
//! `stream_options.include_usage`) still need a usage block in the final
//! response. These character-based heuristics fill the gap:
//! - prose: ~3.2 chars/token (overestimates on purpose)
//! - JSON (tool results): ~2.8 chars/token

use super::types::{Message, Role};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Public API ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for one message, overhead included.
///
/// Function messages carry JSON tool results and use the denser ratio.
pub fn estimate_message_tokens(message: &Message) -> u32 {
    let content = match message.role {
        Role::Function => estimate_json_tokens(&message.content),
        _ => estimate_tokens(&message.content),
    };
    let name = message.name.as_deref().map(estimate_tokens).unwrap_or(0);
    MESSAGE_OVERHEAD_TOKENS + content + name
}

/// Estimate the prompt size of a whole conversation.
pub fn estimate_prompt_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
