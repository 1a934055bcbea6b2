use std::{result::Result as StdResult, sync::Arc};

use rhai::{EvalAltResult, ParseError, Position};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for host-side operations.
pub type Result<T> = StdResult<T, Error>;

#[derive(Error, Debug, Clone)]
/// Errors raised to the host while configuring sessions or fetching sources.
pub enum Error {
    /// A provider pattern failed to compile.
    #[error("Invalid include pattern '{pattern}': {message}")]
    InvalidPattern {
        /// Pattern text as supplied.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// A provider matched a token it has no source for.
    #[error("No source for include token: {token}")]
    SourceNotFound {
        /// Token that was looked up.
        token: String,
    },

    /// A provider failed to produce source text.
    #[error("Provider failed for '{token}': {message}")]
    Provider {
        /// Token that was being fetched.
        token: String,
        /// Error message details.
        message: String,
    },

    /// A binding value could not be converted into a script value.
    #[error("Invalid binding '{name}': {message}")]
    InvalidBinding {
        /// Binding name.
        name: String,
        /// Conversion error details.
        message: String,
    },

    /// No Tokio runtime was available to host the execution.
    #[error("No Tokio runtime available to supervise script execution")]
    NoRuntime,
}

impl Error {
    /// Create a Provider error.
    pub fn provider(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            token: token.into(),
            message: message.into(),
        }
    }
}

/// Errors that end a script execution in the `Failed` state.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// The script failed to parse.
    #[error("Parse error: {0}")]
    Parse(ParseError),
    /// The script failed at runtime.
    #[error("Runtime error: {0}")]
    Runtime(Arc<EvalAltResult>),
    /// Strict include handling rejected the source.
    #[error("Unresolved include: {}", .references.join(", "))]
    UnresolvedInclude {
        /// References that no provider could satisfy.
        references: Vec<String>,
    },
    /// The worker panicked before reporting an outcome.
    #[error("Worker panicked: {0}")]
    Panicked(String),
}

impl From<ParseError> for ScriptError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<Box<EvalAltResult>> for ScriptError {
    fn from(err: Box<EvalAltResult>) -> Self {
        Self::Runtime(Arc::from(err))
    }
}

/// Serializable error details for script evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptErrorInfo {
    /// Short error category.
    pub error_type: String,
    /// Human-readable error message.
    pub message: String,
    /// Location in the script, when available.
    pub location: Option<String>,
    /// Captured backtrace frames, when available.
    pub backtrace: Option<Vec<String>>,
}

/// Convert a script error to a structured, serializable form.
pub fn format_error(err: &ScriptError) -> ScriptErrorInfo {
    match err {
        ScriptError::Parse(err) => ScriptErrorInfo {
            error_type: "parse".to_string(),
            message: err.to_string(),
            location: format_location(err.position()),
            backtrace: None,
        },
        ScriptError::Runtime(err) => ScriptErrorInfo {
            error_type: "runtime".to_string(),
            message: err.to_string(),
            location: format_location(err.position()),
            backtrace: collect_backtrace(err),
        },
        ScriptError::UnresolvedInclude { .. } => ScriptErrorInfo {
            error_type: "include".to_string(),
            message: err.to_string(),
            location: None,
            backtrace: None,
        },
        ScriptError::Panicked(msg) => ScriptErrorInfo {
            error_type: "panic".to_string(),
            message: msg.clone(),
            location: None,
            backtrace: None,
        },
    }
}

fn format_location(pos: Position) -> Option<String> {
    if pos.is_none() {
        None
    } else {
        Some(format!("line {}", pos.line().unwrap_or(0)))
    }
}

/// Walk nested function-call errors so the innermost frame comes last.
fn collect_backtrace(error: &EvalAltResult) -> Option<Vec<String>> {
    let mut frames = Vec::new();
    let mut current = error;
    while let EvalAltResult::ErrorInFunctionCall(name, _, inner, pos) = current {
        match pos.line() {
            Some(line) => frames.push(format!("at {name} (line {line})")),
            None => frames.push(format!("at {name}")),
        }
        current = inner.as_ref();
    }
    if let Some(line) = current.position().line() {
        frames.push(format!("at <main> (line {line})"));
    }
    if frames.is_empty() {
        None
    } else {
        Some(frames)
    }
}
