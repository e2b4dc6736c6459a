//! Core error types for the specflow engine.
//!
//! Errors are split along the failure taxonomy of a workflow run:
//! definition problems are caught before anything executes, step errors
//! describe why a single step ended `failed`, and `WorkflowError` is the
//! terminal reason recorded on a run's outcome. Reporter failures have their
//! own types in `crate::reporting` and never surface here.

/// A structural problem in a workflow, agent, prompt or gate document.
///
/// `path` identifies the offending field, e.g. `phases[1].steps[0].maxRetries`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Loading or locating a definition file failed.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Failed to read '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Invalid definition: {0}")]
    Invalid(#[from] ValidationError),

    #[error("{kind} definition '{name}' not found (searched: {searched})")]
    NotFound {
        kind: &'static str,
        name: String,
        searched: String,
    },
}

/// Syntax error in a condition / `failWhen` / `source` / `input` expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Empty expression")]
    Empty,

    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,
}

/// Why a single step ended with status `failed`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("agent returned '{subtype}'{}", format_errors(.errors))]
    AgentResult { subtype: String, errors: Vec<String> },

    #[error("agent produced no result message")]
    NoResult,

    #[error("agent query failed: {0}")]
    Agent(String),

    #[error("failWhen condition matched: {expression}")]
    FailWhen { expression: String },

    #[error("unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("step exceeded its timeout of {secs}s")]
    Timeout { secs: u64 },

    #[error("{0}")]
    Definition(String),

    #[error("invalid expression '{expression}': {source}")]
    Expression {
        expression: String,
        source: ExpressionError,
    },

    #[error("source '{expression}' must resolve to a list, found {found}")]
    InvalidSource { expression: String, found: String },

    #[error("context binding '{key}' is owned by '{owner}'")]
    BindingConflict { key: String, owner: String },

    #[error("reviewer '{step}' returned an invalid review: {message}")]
    InvalidReview { step: String, message: String },

    #[error("{} of {total} parallel steps failed: {}", .failures.len(), .failures.join("; "))]
    ChildrenFailed { total: usize, failures: Vec<String> },

    #[error("task {index} of {count} failed: {message}")]
    TaskFailed {
        index: usize,
        count: usize,
        message: String,
    },

    #[error("loop exhausted after {iterations} iterations, condition '{condition}' still true{}", .last_error.as_ref().map(|e| format!(" (last iteration: {})", e)).unwrap_or_default())]
    LoopExhausted {
        iterations: u32,
        condition: String,
        last_error: Option<String>,
    },
}

fn format_errors(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(": {}", errors.join("; "))
    }
}

impl From<DefinitionError> for StepError {
    fn from(e: DefinitionError) -> Self {
        StepError::Definition(e.to_string())
    }
}

/// Terminal reason a workflow run did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    #[error("step '{path}' failed: {source}")]
    Step { path: String, source: StepError },

    #[error("workflow exceeded its timeout of {secs}s")]
    Timeout { secs: u64 },
}

impl WorkflowError {
    /// Path of the step the run stopped on, if the failure belongs to one.
    pub fn step_path(&self) -> Option<&str> {
        match self {
            WorkflowError::Step { path, .. } => Some(path),
            WorkflowError::Timeout { .. } => None,
        }
    }
}
