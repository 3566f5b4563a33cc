//! Tool invocation: dispatch, containment and result messages.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::{json, Value};

use super::errors::ToolError;
use super::parser::{self, ToolCall};
use super::registry::{ToolDefinition, ToolRegistry};
use crate::inference::tokens::truncate_utf8;
use crate::inference::types::Message;

/// Appended to a tool result that was cut to fit `max_result_chars`.
const TRUNCATION_MARKER: &str = "...[truncated]";

/// Runs tool calls against a `ToolRegistry`.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_result_chars: usize,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, max_result_chars: usize) -> Self {
        Self {
            registry,
            timeout,
            max_result_chars,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Tool calls in a complete generated text. Zero calls is not an error.
    pub fn extract_calls(&self, text: &str) -> Vec<ToolCall> {
        parser::extract_calls(text)
    }

    /// Run one call.
    ///
    /// Only tools the request declared are callable. Panics and timeouts in
    /// the handler are contained and reported as `ToolError`s.
    pub async fn execute(
        &self,
        call: &ToolCall,
        declared: &[ToolDefinition],
    ) -> Result<Value, ToolError> {
        let not_found = || ToolError::ToolNotFound {
            name: call.name.clone(),
        };
        if !declared.iter().any(|d| d.name == call.name) {
            return Err(not_found());
        }
        let handler = self.registry.handler(&call.name).ok_or_else(not_found)?;

        let arguments = call.arguments.clone();
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(arguments)))
            .map_err(|panic| panicked(&call.name, panic))?;

        match tokio::time::timeout(self.timeout, AssertUnwindSafe(future).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(panicked(&call.name, panic)),
            Err(_) => Err(ToolError::Timeout {
                tool: call.name.clone(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Execute a call and turn the outcome into a function-role message.
    pub async fn invoke(&self, call: &ToolCall, declared: &[ToolDefinition]) -> Message {
        let start = Instant::now();
        let outcome = self.execute(call, declared).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => tracing::info!(tool = %call.name, elapsed_ms, "tool executed"),
            Err(e) => tracing::warn!(tool = %call.name, elapsed_ms, error = %e, "tool failed"),
        }

        self.result_message(call, &outcome)
    }

    /// Serialize an outcome as the message the model sees next turn.
    ///
    /// Failures become `{"error": …, "success": false}`.
    pub fn result_message(&self, call: &ToolCall, outcome: &Result<Value, ToolError>) -> Message {
        let body = match outcome {
            Ok(value) => value.clone(),
            Err(e) => json!({ "error": e.to_string(), "success": false }),
        };
        let content = serde_json::to_string(&body).unwrap_or_else(|_| body.to_string());
        Message::function(&call.name, self.truncate(content))
    }

    fn truncate(&self, content: String) -> String {
        if content.len() <= self.max_result_chars {
            return content;
        }
        let kept = truncate_utf8(&content, self.max_result_chars);
        tracing::debug!(
            original = content.len(),
            kept = kept.len(),
            "tool result truncated"
        );
        format!("{kept}{TRUNCATION_MARKER}")
    }
}

fn panicked(tool: &str, panic: Box<dyn std::any::Any + Send>) -> ToolError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    ToolError::ExecutionFailed {
        tool: tool.to_string(),
        reason: format!("panic: {reason}"),
    }
}

/// System message describing the call grammar and the declared tools.
pub fn tool_prompt(declared: &[ToolDefinition]) -> String {
    let mut prompt = String::from(
        "You have access to the following tools. To use a tool, write a line of the form:\n\n\
         TOOL_CALL: {\"name\": \"tool_name\", \"arguments\": {\"param\": \"value\"}}\n\n\
         You may request several tools, one TOOL_CALL line each. The results are returned \
         to you as function messages; then answer the user. Only use tools when needed.\n\n\
         Available tools:\n",
    );
    for tool in declared {
        prompt.push_str(&format!("\n- {}: {}", tool.name, tool.description));
        if !tool.parameters.is_null() {
            prompt.push_str(&format!("\n  Parameters: {}", tool.parameters));
        }
    }
    prompt
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    fn invoker_with(registry: ToolRegistry) -> ToolInvoker {
        ToolInvoker::new(Arc::new(registry), Duration::from_millis(200), 6_000)
    }

    fn declared(names: &[&str]) -> Vec<ToolDefinition> {
        names
            .iter()
            .map(|n| ToolDefinition::new(n, "", Value::Null))
            .collect()
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_calculator_message() {
        let invoker = invoker_with(ToolRegistry::with_builtins());
        let msg = invoker
            .invoke(&call("calculator", json!({"expression": "2+2"})), &declared(&["calculator"]))
            .await;
        assert_eq!(msg.role, Role::Function);
        assert_eq!(msg.name.as_deref(), Some("calculator"));
        assert!(msg.content.starts_with(r#"{"result":4,"#));
    }

    #[tokio::test]
    async fn test_undeclared_tool_not_found() {
        let invoker = invoker_with(ToolRegistry::with_builtins());
        let err = invoker
            .execute(&call("calculator", json!({})), &declared(&["weather"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::ToolNotFound {
                name: "calculator".into()
            }
        );
    }

    #[tokio::test]
    async fn test_declared_but_unregistered_not_found() {
        let invoker = invoker_with(ToolRegistry::new());
        let msg = invoker
            .invoke(&call("weather", json!({})), &declared(&["weather"]))
            .await;
        let body: Value = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "unknown tool: weather");
    }

    #[tokio::test]
    async fn test_oversized_expression_becomes_result() {
        let invoker = invoker_with(ToolRegistry::with_builtins());
        let expression = format!("1{}", "+1".repeat(100_000));
        let msg = invoker
            .invoke(
                &call("calculator", json!({ "expression": expression })),
                &declared(&["calculator"]),
            )
            .await;
        let body: Value = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("longer than"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_result() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolDefinition::new("flaky", "", Value::Null), |_| async {
            Err(ToolError::ExecutionFailed {
                tool: "flaky".into(),
                reason: "disk full".into(),
            })
        });
        let msg = invoker_with(registry)
            .invoke(&call("flaky", json!({})), &declared(&["flaky"]))
            .await;
        assert!(msg.content.contains("disk full"));
        assert!(msg.content.contains(r#""success":false"#));
    }

    #[tokio::test]
    async fn test_panicking_handler_contained() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolDefinition::new("boom", "", Value::Null), |_| async {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let err = invoker_with(registry)
            .execute(&call("boom", json!({})), &declared(&["boom"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { reason, .. } if reason.contains("kaboom")));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolDefinition::new("slow", "", Value::Null), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let err = invoker_with(registry)
            .execute(&call("slow", json!({})), &declared(&["slow"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 200, .. }));
    }

    #[tokio::test]
    async fn test_long_result_truncated() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolDefinition::new("big", "", Value::Null), |_| async {
            Ok(json!({ "data": "═".repeat(100) }))
        });
        let invoker = ToolInvoker::new(Arc::new(registry), Duration::from_secs(1), 50);
        let msg = invoker
            .invoke(&call("big", json!({})), &declared(&["big"]))
            .await;
        assert!(msg.content.ends_with(TRUNCATION_MARKER));
        assert!(msg.content.len() <= 50 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_tool_prompt_lists_tools() {
        let prompt = tool_prompt(&ToolRegistry::with_builtins()
            .names()
            .iter()
            .map(|n| ToolDefinition::new(n, "desc", json!({"type": "object"})))
            .collect::<Vec<_>>());
        assert!(prompt.contains("TOOL_CALL: {\"name\""));
        assert!(prompt.contains("- calculator: desc"));
        assert!(prompt.contains("- current_time: desc"));
    }
}
