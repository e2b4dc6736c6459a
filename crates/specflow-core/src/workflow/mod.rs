//! Workflow engine: YAML-driven multi-phase agent orchestration.
//!
//! Workflows are declared in YAML, validated into an immutable step tree,
//! then executed against an agent backend and a registry of code handlers.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► validator ──► WorkflowDefinition ──► WorkflowExecutor
//!                                                            │
//!        agents/ gates/ prompts/ schemas/ ──► DefinitionLocator
//!                                                            │
//!                           template + expression ──► ExecutionContext
//!                                                            │
//!                                AgentQuery (MessagesApiAgent, fakes)
//!                                                            │
//!                           audit trail ──► ReporterManager ──► log / PR comment
//! ```

pub mod agent;
pub mod agent_caller;
pub mod audit;
pub mod context;
pub mod definitions;
pub mod executor;
pub mod expression;
pub mod handlers;
pub mod schema;
pub mod template;
pub mod validator;

pub use agent::{AgentMessage, AgentQuery, AgentRequest, MessageStream, ResultMessage};
pub use agent_caller::{MessagesApiAgent, MessagesApiConfig};
pub use audit::{AuditStatus, ExecutionSummary, WorkflowAuditEntry};
pub use context::ExecutionContext;
pub use definitions::{DefinitionKind, DefinitionLocator};
pub use executor::{Escalation, WorkflowExecutor, WorkflowOutcome};
pub use handlers::HandlerRegistry;
pub use schema::{StepDefinition, StepKind, Visibility, WorkflowDefinition};
