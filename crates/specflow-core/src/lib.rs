//! specflow core: declarative multi-phase agent workflows.
//!
//! A workflow is a YAML document describing phases of agent prompts, code
//! handlers, review gate groups, retry loops and per-task fan-out. This
//! crate validates those documents, executes them against an agent
//! backend, aggregates review verdicts and streams progress to reporters.
//!
//! The crate has no CLI or server dependency; `specflow-cli` is a thin
//! front end over [`workflow::WorkflowExecutor`].

pub mod error;
pub mod reporting;
pub mod review;
pub mod workflow;

// Convenience re-exports
pub use error::{DefinitionError, StepError, ValidationError, WorkflowError};
pub use reporting::{Reporter, ReporterFactories, ReporterManager};
pub use review::{AggregatedReviewResult, ReviewIssue, ReviewResult, Severity, Verdict};
pub use workflow::{WorkflowDefinition, WorkflowExecutor, WorkflowOutcome};
