//! Typed workflow definitions.
//!
//! A workflow document drives a nested tree of steps:
//!
//! ```yaml
//! name: implement-spec
//! version: 1
//!
//! defaults:
//!   agent: implementer
//!   model: sonnet
//!   permissionMode: acceptEdits
//!
//! safety:
//!   maxLoopRetries: 5
//!   stepTimeoutSecs: 900
//!   workflowTimeoutSecs: 7200
//!
//! reporters:
//!   - type: pr-comment
//!     config:
//!       owner: "{{env.GITHUB_OWNER}}"
//!       repo: "{{env.GITHUB_REPO}}"
//!       issueNumber: "{{context.prNumber}}"
//!       token: "{{env.GITHUB_TOKEN}}"
//!
//! phases:
//!   - name: analyze
//!     agent: spec-analyzer
//!     prompt: { file: analyze-spec }
//!     output: analysis
//!     failWhen: tasks.length === 0
//!
//!   - name: implement
//!     type: per-task
//!     source: analysis.tasks
//!     output: implementations
//!     steps:
//!       - name: code
//!         prompt: "Implement {{task.title}}: {{task.description}}"
//!
//!   - name: review-cycle
//!     type: loop
//!     condition: "!review || review.hasActionableIssues"
//!     maxRetries: 3
//!     onExhausted: escalate
//!     steps:
//!       - name: review
//!         type: gate-group
//!         output: review
//!         steps:
//!           - { name: security, agent: security-reviewer }
//!           - { name: quality, agent: quality-reviewer }
//!       - name: fix
//!         condition: review.hasActionableIssues
//!         prompt: { file: fix-issues }
//! ```
//!
//! Documents are turned into these types by [`crate::workflow::validator`];
//! once built they are never mutated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DefinitionError;
use crate::review::Severity;
use crate::workflow::validator;

/// Top-level workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,
    pub description: Option<String>,
    pub defaults: WorkflowDefaults,
    pub safety: SafetyLimits,
    pub reporters: Vec<ReporterSpec>,
    pub phases: Vec<StepDefinition>,
}

/// Workflow-wide fallbacks for agent-prompt steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowDefaults {
    pub agent: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub setting_sources: Vec<String>,
}

/// Hard ceilings enforced by the executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafetyLimits {
    pub max_loop_retries: Option<u32>,
    pub step_timeout_secs: Option<u64>,
    pub workflow_timeout_secs: Option<u64>,
}

/// A reporter to attach to the run. `config` values are resolved against
/// the environment and run context at initialization time.
#[derive(Debug, Clone, PartialEq)]
pub struct ReporterSpec {
    pub kind: String,
    pub enabled: bool,
    pub config: Map<String, Value>,
}

/// How a step's progress is shown by reporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Visible,
    Silent,
    Summary,
}

impl Visibility {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "visible" => Some(Self::Visible),
            "silent" => Some(Self::Silent),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::Silent => "silent",
            Self::Summary => "summary",
        }
    }
}

/// What a loop does when its condition still holds after `maxRetries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Complete, but flag the step for human attention (default)
    #[default]
    Escalate,
    /// Log the unresolved condition and continue
    Warn,
    /// Fail the step, and with it the workflow
    Fail,
}

impl ExhaustionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "escalate" => Some(Self::Escalate),
            "warn" => Some(Self::Warn),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// One node of the step tree.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub output: Option<String>,
    pub enabled: bool,
    /// Entry gate. Loops keep their iteration condition in [`LoopStep`].
    pub condition: Option<String>,
    pub visibility: Visibility,
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    AgentPrompt(AgentPromptStep),
    Code(CodeStep),
    Parallel(ParallelStep),
    Loop(LoopStep),
    PerTask(PerTaskStep),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromptSource {
    Inline(String),
    /// Name of a file under `prompts/`
    File(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentPromptStep {
    pub agent: Option<String>,
    pub prompt: Option<PromptSource>,
    pub model: Option<String>,
    pub input: Option<String>,
    pub fail_when: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeStep {
    pub handler: String,
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelStep {
    /// Declared as `gate-group` rather than `parallel`
    pub gate_group: bool,
    pub min_severity: Option<Severity>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopStep {
    pub condition: String,
    pub max_retries: u32,
    pub on_exhausted: ExhaustionPolicy,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerTaskStep {
    pub source: String,
    pub steps: Vec<StepDefinition>,
}

impl StepDefinition {
    /// Child steps, empty for leaves.
    pub fn children(&self) -> &[StepDefinition] {
        match &self.kind {
            StepKind::Parallel(p) => &p.steps,
            StepKind::Loop(l) => &l.steps,
            StepKind::PerTask(p) => &p.steps,
            StepKind::AgentPrompt(_) | StepKind::Code(_) => &[],
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            StepKind::AgentPrompt(_) => "agent-prompt",
            StepKind::Code(_) => "code",
            StepKind::Parallel(p) if p.gate_group => "gate-group",
            StepKind::Parallel(_) => "parallel",
            StepKind::Loop(_) => "loop",
            StepKind::PerTask(_) => "per-task",
        }
    }
}

/// Join a parent path and a step name into the step's path.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

impl WorkflowDefinition {
    /// Parse and validate a workflow from YAML (JSON is accepted too).
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        let document: Value = serde_yaml::from_str(yaml).map_err(|e| DefinitionError::Parse {
            path: "<workflow>".to_string(),
            message: e.to_string(),
        })?;
        Ok(validator::validate_workflow(&document)?)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            DefinitionError::Parse { message, .. } => DefinitionError::Parse {
                path: path.to_string(),
                message,
            },
            other => other,
        })
    }

    /// Visit every step depth-first together with its path.
    pub fn walk<'a>(&'a self, mut visit: impl FnMut(&str, usize, &'a StepDefinition)) {
        fn go<'a>(
            steps: &'a [StepDefinition],
            parent: &str,
            depth: usize,
            visit: &mut dyn FnMut(&str, usize, &'a StepDefinition),
        ) {
            for step in steps {
                let path = child_path(parent, &step.name);
                visit(&path, depth, step);
                go(step.children(), &path, depth + 1, visit);
            }
        }
        go(&self.phases, "", 0, &mut visit);
    }
}
