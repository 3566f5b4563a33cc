//! Tool error types.
//!
//! None of these abort a completion: the invoker folds every `ToolError` into
//! a structured function-role message so the model can react to it.

use thiserror::Error;

/// Errors raised while resolving or running a tool.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    /// The call names a tool that is not declared or not registered.
    #[error("unknown tool: {name}")]
    ToolNotFound { name: String },

    /// The arguments do not fit the tool's parameters.
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The handler failed (or panicked).
    #[error("tool {tool} failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },

    /// The handler did not finish within the tool timeout.
    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },
}

/// Errors from the arithmetic expression parser and evaluator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalcError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("invalid number '{text}'")]
    InvalidNumber { text: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected trailing input at position {pos}")]
    TrailingInput { pos: usize },

    #[error("expression nested deeper than {max} levels")]
    TooDeep { max: usize },

    #[error("expression longer than {max} tokens")]
    TooLong { max: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NotFinite,
}
