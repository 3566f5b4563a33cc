//! Tool invocation layer.
//!
//! - `parser`: the `TOOL_CALL:` directive grammar, incremental filter
//! - `registry`: explicitly registered `name → handler` table, built-ins
//! - `calculator`: arithmetic parser backing the `calculator` built-in
//! - `invoker`: dispatch with timeout and panic containment, result messages

pub mod calculator;
pub mod errors;
pub mod invoker;
pub mod parser;
pub mod registry;

pub use errors::{CalcError, ToolError};
pub use invoker::{tool_prompt, ToolInvoker};
pub use parser::{extract_calls, DirectiveFilter, ToolCall, CALL_MARKER};
pub use registry::{ToolDefinition, ToolHandler, ToolRegistry};
