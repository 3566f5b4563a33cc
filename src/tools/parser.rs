//! Tool-call directive parsing.
//!
//! A directive is the marker `TOOL_CALL:` followed (after optional
//! whitespace) by one balanced JSON object:
//!
//! ```text
//! TOOL_CALL: {"name": "calculator", "arguments": {"expression": "2+2"}}
//! ```
//!
//! A turn may contain any number of directives. Everything outside them is
//! visible text. `DirectiveFilter` separates the two incrementally so a
//! streamed turn can forward visible text as it arrives; `extract_calls`
//! runs the same filter over a complete text.

use serde::Deserialize;
use serde_json::{Map, Value};

/// The marker that opens a directive.
pub const CALL_MARKER: &str = "TOOL_CALL:";

/// Longest payload held back as a possible directive. Past this the
/// directive is abandoned and its text released.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    /// Always a JSON object.
    pub arguments: Value,
}

// ─── Incremental filter ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    /// Marker seen; skipping whitespace up to the opening brace.
    AwaitPayload,
    /// Inside the JSON object.
    Payload {
        depth: u32,
        in_string: bool,
        escaped: bool,
    },
}

/// Splits generated text into visible text and directive payloads.
///
/// `push` returns the visible text that is safe to forward now. Only a
/// possible partial marker at the end of the input (or an unfinished
/// directive) is held back.
#[derive(Debug)]
pub struct DirectiveFilter {
    mode: Mode,
    pending: String,
    /// Raw text of the directive in progress, marker included.
    raw: String,
    payload_start: usize,
    payloads: Vec<String>,
}

impl Default for DirectiveFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectiveFilter {
    pub fn new() -> Self {
        Self {
            mode: Mode::Text,
            pending: String::new(),
            raw: String::new(),
            payload_start: 0,
            payloads: Vec::new(),
        }
    }

    /// Feed a fragment; returns the visible text it releases.
    pub fn push(&mut self, fragment: &str) -> String {
        self.pending.push_str(fragment);
        let mut visible = String::new();

        loop {
            match self.mode {
                Mode::Text => {
                    if let Some(idx) = self.pending.find(CALL_MARKER) {
                        visible.push_str(&self.pending[..idx]);
                        self.raw.clear();
                        self.raw.push_str(CALL_MARKER);
                        self.pending.drain(..idx + CALL_MARKER.len());
                        self.mode = Mode::AwaitPayload;
                        continue;
                    }
                    let keep = partial_marker_len(&self.pending);
                    let release = self.pending.len() - keep;
                    visible.push_str(&self.pending[..release]);
                    self.pending.drain(..release);
                    break;
                }
                Mode::AwaitPayload => {
                    let trimmed = self.pending.trim_start();
                    let skipped = self.pending.len() - trimmed.len();
                    self.raw.push_str(&self.pending[..skipped]);
                    self.pending.drain(..skipped);

                    match self.pending.chars().next() {
                        None => break,
                        Some('{') => {
                            self.payload_start = self.raw.len();
                            self.mode = Mode::Payload {
                                depth: 0,
                                in_string: false,
                                escaped: false,
                            };
                        }
                        Some(_) => {
                            // Marker without a payload is plain text.
                            visible.push_str(&self.raw);
                            self.raw.clear();
                            self.mode = Mode::Text;
                        }
                    }
                }
                Mode::Payload { .. } => {
                    match self.scan_payload() {
                        Some(consumed) => {
                            self.raw.push_str(&self.pending[..consumed]);
                            self.pending.drain(..consumed);
                            if self.payload_len() > MAX_PAYLOAD_BYTES {
                                self.abandon(&mut visible);
                            } else {
                                self.payloads.push(self.raw[self.payload_start..].to_string());
                                self.raw.clear();
                                self.mode = Mode::Text;
                            }
                        }
                        None => {
                            self.raw.push_str(&self.pending);
                            self.pending.clear();
                            if self.payload_len() > MAX_PAYLOAD_BYTES {
                                self.abandon(&mut visible);
                            }
                            break;
                        }
                    }
                }
            }
        }

        visible
    }

    fn payload_len(&self) -> usize {
        self.raw.len() - self.payload_start
    }

    /// Give up on the directive in progress and release it as text.
    fn abandon(&mut self, visible: &mut String) {
        tracing::warn!(
            payload_len = self.payload_len(),
            max = MAX_PAYLOAD_BYTES,
            "oversized tool-call directive treated as text"
        );
        visible.push_str(&self.raw);
        self.raw.clear();
        self.mode = Mode::Text;
    }

    /// Advance the brace matcher over `pending`. Returns the byte length up
    /// to and including the closing brace, if it was reached.
    fn scan_payload(&mut self) -> Option<usize> {
        let Mode::Payload {
            mut depth,
            mut in_string,
            mut escaped,
        } = self.mode
        else {
            return None;
        };

        let mut end = None;
        for (i, ch) in self.pending.char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        end = Some(i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        self.mode = Mode::Payload {
            depth,
            in_string,
            escaped,
        };
        end
    }

    /// Flush at end of turn. An unterminated directive is released as text.
    pub fn finish(&mut self) -> String {
        let mut visible = String::new();
        if self.mode != Mode::Text {
            tracing::warn!(
                raw_len = self.raw.len(),
                "unterminated tool-call directive treated as text"
            );
            visible.push_str(&self.raw);
            self.raw.clear();
            self.mode = Mode::Text;
        }
        visible.push_str(&self.pending);
        self.pending.clear();
        visible
    }

    /// Parse the payloads collected so far. Malformed ones are logged and
    /// skipped.
    pub fn take_calls(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.payloads)
            .iter()
            .filter_map(|payload| parse_payload(payload))
            .collect()
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// marker.
fn partial_marker_len(text: &str) -> usize {
    (1..CALL_MARKER.len())
        .rev()
        .find(|&k| text.ends_with(&CALL_MARKER[..k]))
        .unwrap_or(0)
}

// ─── Payload parsing ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn parse_payload(payload: &str) -> Option<ToolCall> {
    let raw: RawCall = match serde_json::from_str(payload) {
        Ok(raw) => raw,
        Err(first) => match serde_json::from_str(&repair_trailing_commas(payload)) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::warn!(error = %first, payload = %payload, "skipping malformed tool call");
                return None;
            }
        },
    };

    if raw.name.trim().is_empty() {
        tracing::warn!(payload = %payload, "skipping tool call with empty name");
        return None;
    }

    let arguments = match raw.arguments {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        // OpenAI-style models sometimes encode arguments as a JSON string.
        Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
            Ok(Value::Object(map)) => Value::Object(map),
            _ => {
                tracing::warn!(tool = %raw.name, "skipping tool call with non-object arguments");
                return None;
            }
        },
        _ => {
            tracing::warn!(tool = %raw.name, "skipping tool call with non-object arguments");
            return None;
        }
    };

    Some(ToolCall {
        name: raw.name.trim().to_string(),
        arguments,
    })
}

/// Remove trailing commas before `}` or `]` outside strings.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            result.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(ch);
    }

    result
}

/// Extract every well-formed call from a complete text.
pub fn extract_calls(text: &str) -> Vec<ToolCall> {
    let mut filter = DirectiveFilter::new();
    filter.push(text);
    filter.finish();
    filter.take_calls()
}

/// The visible text of a complete turn.
pub fn strip_directives(text: &str) -> String {
    let mut filter = DirectiveFilter::new();
    let mut visible = filter.push(text);
    visible.push_str(&filter.finish());
    visible
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_single_call() {
        let text = r#"TOOL_CALL: {"name":"calculator","arguments":{"expression":"2+2"}}"#;
        let calls = extract_calls(text);
        assert_eq!(
            calls,
            vec![ToolCall {
                name: "calculator".into(),
                arguments: json!({"expression": "2+2"}),
            }]
        );
        assert_eq!(strip_directives(text), "");
    }

    #[test]
    fn test_extract_multiple_calls_with_surrounding_text() {
        let text = "Let me check.\nTOOL_CALL: {\n  \"name\": \"a\",\n  \"arguments\": {}\n}\nand\nTOOL_CALL:{\"name\":\"b\"}\nDone.";
        let calls = extract_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
        assert_eq!(calls[1].arguments, json!({}));
        assert_eq!(strip_directives(text), "Let me check.\n\nand\n\nDone.");
    }

    #[test]
    fn test_nested_braces_and_braces_in_strings() {
        let text = r#"TOOL_CALL: {"name":"echo","arguments":{"text":"a } b { \"q\"","nested":{"x":1}}} tail"#;
        let calls = extract_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["text"], "a } b { \"q\"");
        assert_eq!(calls[0].arguments["nested"]["x"], 1);
        assert_eq!(strip_directives(text), " tail");
    }

    #[test]
    fn test_no_calls_is_normal() {
        assert!(extract_calls("The answer is 4.").is_empty());
        assert_eq!(strip_directives("The answer is 4."), "The answer is 4.");
    }

    #[test]
    fn test_malformed_payload_skipped() {
        let text = r#"TOOL_CALL: {"name": calculator} TOOL_CALL: {"name":"ok","arguments":{}}"#;
        let calls = extract_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ok");
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let text = r#"TOOL_CALL: {"name":"calculator","arguments":{"expression":"1,2",},}"#;
        let calls = extract_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["expression"], "1,2");
    }

    #[test]
    fn test_string_encoded_arguments() {
        let text = r#"TOOL_CALL: {"name":"calculator","arguments":"{\"expression\":\"3*3\"}"}"#;
        let calls = extract_calls(text);
        assert_eq!(calls[0].arguments, json!({"expression": "3*3"}));
    }

    #[test]
    fn test_non_object_arguments_skipped() {
        assert!(extract_calls(r#"TOOL_CALL: {"name":"x","arguments":[1,2]}"#).is_empty());
    }

    #[test]
    fn test_marker_without_payload_is_text() {
        let text = "Use TOOL_CALL: when needed.";
        assert!(extract_calls(text).is_empty());
        assert_eq!(strip_directives(text), text);
    }

    #[test]
    fn test_unterminated_directive_released_as_text() {
        let text = r#"TOOL_CALL: {"name":"calculator","arguments":{"#;
        assert!(extract_calls(text).is_empty());
        assert_eq!(strip_directives(text), text);
    }

    #[test]
    fn test_streaming_holds_back_partial_marker() {
        let mut filter = DirectiveFilter::new();
        assert_eq!(filter.push("Checking TOOL"), "Checking ");
        assert_eq!(filter.push("_CA"), "");
        assert_eq!(filter.push("L: {\"name\":\"calc"), "");
        assert_eq!(filter.push("ulator\",\"arguments\":{}}"), "");
        assert_eq!(filter.push(" done"), " done");
        assert_eq!(filter.finish(), "");
        let calls = filter.take_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "calculator");
    }

    #[test]
    fn test_streaming_false_partial_marker_released() {
        let mut filter = DirectiveFilter::new();
        assert_eq!(filter.push("TOO"), "");
        assert_eq!(filter.push(" many"), "TOO many");
        assert_eq!(filter.push("T"), "");
        assert_eq!(filter.finish(), "T");
    }

    #[test]
    fn test_streaming_matches_whole_text_for_any_split() {
        let text = "A TOOL_CALL: {\"name\":\"x\",\"arguments\":{\"s\":\"}\"}} B TOOL_CALL: oops";
        let expected = strip_directives(text);
        for split in 0..=text.len() {
            if !text.is_char_boundary(split) {
                continue;
            }
            let mut filter = DirectiveFilter::new();
            let mut visible = filter.push(&text[..split]);
            visible.push_str(&filter.push(&text[split..]));
            visible.push_str(&filter.finish());
            assert_eq!(visible, expected, "split at {split}");
            assert_eq!(filter.take_calls().len(), 1, "split at {split}");
        }
    }

    #[test]
    fn test_unclosed_payload_released_past_limit() {
        let opening = "TOOL_CALL: {\"name\": \"x\", ";
        let mut filter = DirectiveFilter::new();
        assert_eq!(filter.push(opening), "");

        let word = "lorem ipsum ";
        let mut released = String::new();
        let mut held_back_max = 0;
        for _ in 0..4_000 {
            released.push_str(&filter.push(word));
            held_back_max = held_back_max.max(filter.raw.len());
        }

        // Text flows again during the turn, not only at `finish`.
        assert!(held_back_max <= CALL_MARKER.len() + 1 + MAX_PAYLOAD_BYTES + word.len());
        assert!(released.starts_with("TOOL_CALL: {\"name\""));
        assert!(released.len() > 4_000 * word.len() - MAX_PAYLOAD_BYTES);

        released.push_str(&filter.finish());
        assert_eq!(released.len(), opening.len() + 4_000 * word.len());
        assert!(filter.take_calls().is_empty());
    }

    #[test]
    fn test_oversized_complete_payload_is_text() {
        let big = "y".repeat(MAX_PAYLOAD_BYTES);
        let text = format!(r#"TOOL_CALL: {{"name":"x","arguments":{{"s":"{big}"}}}} after"#);
        assert!(extract_calls(&text).is_empty());
        assert_eq!(strip_directives(&text), text);

        let mut filter = DirectiveFilter::new();
        let mut visible = String::new();
        for chunk in text.as_bytes().chunks(100) {
            visible.push_str(&filter.push(std::str::from_utf8(chunk).unwrap()));
        }
        visible.push_str(&filter.finish());
        assert_eq!(visible, text);
        assert!(filter.take_calls().is_empty());
    }

    #[test]
    fn test_repair_trailing_commas_ignores_strings() {
        assert_eq!(repair_trailing_commas(r#"{"a":",}",}"#), r#"{"a":",}"}"#);
    }
}
