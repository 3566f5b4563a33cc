//! Tool capability table.
//!
//! Tools are registered explicitly at startup as `name → handler` entries;
//! nothing is discovered or loaded at runtime. Two built-ins ship with the
//! crate: `calculator` and `current_time`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::calculator;
use super::errors::ToolError;

// ─── Definitions ─────────────────────────────────────────────────────────────

/// A tool as declared by a request (or described by a registered handler).
///
/// Deserializes from either the flat form `{name, description, parameters}`
/// or the OpenAI form `{"type": "function", "function": {…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ToolDefinitionWire")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolDefinitionWire {
    OpenAi { function: FlatDefinition },
    Flat(FlatDefinition),
}

#[derive(Deserialize)]
struct FlatDefinition {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
}

impl From<ToolDefinitionWire> for ToolDefinition {
    fn from(wire: ToolDefinitionWire) -> Self {
        let (ToolDefinitionWire::OpenAi { function: flat } | ToolDefinitionWire::Flat(flat)) = wire;
        Self {
            name: flat.name,
            description: flat.description,
            parameters: flat.parameters,
        }
    }
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Executes one tool.
///
/// The returned future is `'static` so the invoker can bound it with a
/// timeout and contain panics.
pub trait ToolHandler: Send + Sync {
    fn call(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>>;
}

/// Adapter for plain async closures.
struct FnHandler<F>(F);

impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    fn call(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        (self.0)(arguments).boxed()
    }
}

struct CalculatorTool;

impl ToolHandler for CalculatorTool {
    fn call(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        async move {
            let expression = arguments
                .get("expression")
                .and_then(Value::as_str)
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: "calculator".into(),
                    reason: "missing string argument 'expression'".into(),
                })?;

            let value =
                calculator::evaluate(expression).map_err(|e| ToolError::InvalidArguments {
                    tool: "calculator".into(),
                    reason: e.to_string(),
                })?;

            Ok(json!({
                "result": calculator::number_to_json(value),
                "expression": expression,
                "success": true,
            }))
        }
        .boxed()
    }
}

struct CurrentTimeTool;

impl ToolHandler for CurrentTimeTool {
    fn call(&self, _arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        async move {
            let now = chrono::Utc::now();
            Ok(json!({
                "utc": now.to_rfc3339(),
                "unix": now.timestamp(),
                "success": true,
            }))
        }
        .boxed()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// The `name → handler` table consulted by the invoker.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            ToolDefinition::new(
                "calculator",
                "Evaluate an arithmetic expression (+ - * / ^, parentheses, unary minus).",
                json!({
                    "type": "object",
                    "properties": {
                        "expression": {"type": "string", "description": "e.g. (2 + 3) * 4"}
                    },
                    "required": ["expression"]
                }),
            ),
            Arc::new(CalculatorTool),
        );
        registry.register(
            ToolDefinition::new(
                "current_time",
                "Current UTC date and time.",
                json!({"type": "object", "properties": {}}),
            ),
            Arc::new(CurrentTimeTool),
        );
        registry
    }

    /// Register (or replace) a tool.
    pub fn register(&mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        tracing::debug!(tool = %definition.name, "tool registered");
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handler,
            },
        );
    }

    /// Register an async closure as a tool.
    pub fn register_fn<F, Fut>(&mut self, definition: ToolDefinition, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register(definition, Arc::new(FnHandler(f)));
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|t| Arc::clone(&t.handler))
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| &t.definition)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
