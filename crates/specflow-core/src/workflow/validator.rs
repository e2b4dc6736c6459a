//! Definition validator: turns an untyped document into a typed step tree.
//!
//! Validation is structural: expressions are parsed to catch syntax errors
//! but never evaluated. Every error names the offending field path.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::review::Severity;
use crate::workflow::expression;
use crate::workflow::schema::{
    AgentPromptStep, CodeStep, ExhaustionPolicy, LoopStep, ParallelStep, PerTaskStep,
    PromptSource, ReporterSpec, SafetyLimits, StepDefinition, StepKind, Visibility,
    WorkflowDefaults, WorkflowDefinition,
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const COMMON_STEP_KEYS: &[&str] = &[
    "name",
    "type",
    "description",
    "output",
    "enabled",
    "condition",
    "visibility",
];

/// Binding names that the executor itself provides.
const RESERVED_BINDINGS: &[&str] = &[
    "output",
    "input",
    "this",
    "task",
    "taskIndex",
    "taskCount",
    "__proto__",
    "constructor",
    "prototype",
];

type Result<T> = std::result::Result<T, ValidationError>;

fn field(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        let at = if path.is_empty() { "<root>" } else { path };
        ValidationError::new(at, "expected a mapping")
    })
}

fn optional_string(obj: &Map<String, Value>, path: &str, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::new(field(path, key), "expected a string")),
    }
}

fn required_string(obj: &Map<String, Value>, path: &str, key: &str, what: &str) -> Result<String> {
    match optional_string(obj, path, key)? {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ValidationError::new(field(path, key), format!("{} is required", what))),
    }
}

fn optional_bool(obj: &Map<String, Value>, path: &str, key: &str) -> Result<Option<bool>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::new(field(path, key), "expected a boolean")),
    }
}

fn positive_integer(obj: &Map<String, Value>, path: &str, key: &str) -> Result<Option<u64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v > 0 => Ok(Some(v)),
            _ => Err(ValidationError::new(
                field(path, key),
                format!("expected a positive integer, found {}", n),
            )),
        },
        Some(other) => Err(ValidationError::new(
            field(path, key),
            format!("expected a positive integer, found {}", other),
        )),
    }
}

fn string_list(obj: &Map<String, Value>, path: &str, key: &str) -> Result<Vec<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ValidationError::new(format!("{}[{}]", field(path, key), i), "expected a string")
                })
            })
            .collect(),
        Some(_) => Err(ValidationError::new(field(path, key), "expected a list of strings")),
    }
}

fn reject_unknown(obj: &Map<String, Value>, path: &str, allowed: &[&[&str]]) -> Result<()> {
    for key in obj.keys() {
        if !allowed.iter().any(|group| group.contains(&key.as_str())) {
            return Err(ValidationError::new(field(path, key), "unknown field"));
        }
    }
    Ok(())
}

fn check_expression(obj: &Map<String, Value>, path: &str, key: &str) -> Result<Option<String>> {
    let Some(src) = optional_string(obj, path, key)? else {
        return Ok(None);
    };
    expression::parse(&src)
        .map_err(|e| ValidationError::new(field(path, key), format!("invalid expression: {}", e)))?;
    Ok(Some(src))
}

/// A step name: non-empty and free of whitespace and `/`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// An output binding usable as the first segment of an expression path.
fn is_valid_binding(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-'))
        && !RESERVED_BINDINGS.contains(&name)
}

/// Validate a whole workflow document.
pub fn validate_workflow(document: &Value) -> Result<WorkflowDefinition> {
    let obj = as_object(document, "")?;
    reject_unknown(
        obj,
        "",
        &[&["name", "version", "description", "defaults", "safety", "reporters", "phases"]],
    )?;

    let name = required_string(obj, "", "name", "workflow name")?;

    let version = match obj.get("version") {
        None | Some(Value::Null) => {
            return Err(ValidationError::new("version", "version is required"))
        }
        Some(_) => positive_integer(obj, "", "version")?
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| ValidationError::new("version", "version out of range"))?,
    };

    let description = optional_string(obj, "", "description")?;
    let defaults = match obj.get("defaults") {
        None | Some(Value::Null) => WorkflowDefaults::default(),
        Some(v) => validate_defaults(v)?,
    };
    let safety = match obj.get("safety") {
        None | Some(Value::Null) => SafetyLimits::default(),
        Some(v) => validate_safety(v)?,
    };
    let reporters = match obj.get("reporters") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| validate_reporter(item, &format!("reporters[{}]", i)))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(ValidationError::new("reporters", "expected a list")),
    };

    let phases = match obj.get("phases") {
        Some(Value::Array(items)) if !items.is_empty() => validate_steps(items, "phases")?,
        Some(Value::Array(_)) => {
            return Err(ValidationError::new("phases", "at least one phase is required"))
        }
        None | Some(Value::Null) => return Err(ValidationError::new("phases", "phases are required")),
        Some(_) => return Err(ValidationError::new("phases", "expected a list of steps")),
    };

    Ok(WorkflowDefinition {
        name,
        version,
        description,
        defaults,
        safety,
        reporters,
        phases,
    })
}

fn validate_defaults(value: &Value) -> Result<WorkflowDefaults> {
    let path = "defaults";
    let obj = as_object(value, path)?;
    reject_unknown(obj, path, &[&["agent", "model", "permissionMode", "settingSources"]])?;
    Ok(WorkflowDefaults {
        agent: optional_string(obj, path, "agent")?,
        model: optional_string(obj, path, "model")?,
        permission_mode: optional_string(obj, path, "permissionMode")?,
        setting_sources: string_list(obj, path, "settingSources")?,
    })
}

fn validate_safety(value: &Value) -> Result<SafetyLimits> {
    let path = "safety";
    let obj = as_object(value, path)?;
    reject_unknown(
        obj,
        path,
        &[&["maxLoopRetries", "stepTimeoutSecs", "workflowTimeoutSecs"]],
    )?;
    let max_loop_retries = positive_integer(obj, path, "maxLoopRetries")?
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX));
    Ok(SafetyLimits {
        max_loop_retries,
        step_timeout_secs: positive_integer(obj, path, "stepTimeoutSecs")?,
        workflow_timeout_secs: positive_integer(obj, path, "workflowTimeoutSecs")?,
    })
}

fn validate_reporter(value: &Value, path: &str) -> Result<ReporterSpec> {
    let obj = as_object(value, path)?;
    reject_unknown(obj, path, &[&["type", "enabled", "config"]])?;
    let kind = required_string(obj, path, "type", "reporter type")?;
    let config = match obj.get("config") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ValidationError::new(field(path, "config"), "expected a mapping")),
    };
    Ok(ReporterSpec {
        kind,
        enabled: optional_bool(obj, path, "enabled")?.unwrap_or(true),
        config,
    })
}

fn validate_steps(items: &[Value], path: &str) -> Result<Vec<StepDefinition>> {
    let mut names = HashSet::new();
    let mut steps = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let step_path = format!("{}[{}]", path, i);
        let step = validate_step(item, &step_path)?;
        if !names.insert(step.name.clone()) {
            return Err(ValidationError::new(
                field(&step_path, "name"),
                format!("duplicate step name '{}' among siblings", step.name),
            ));
        }
        steps.push(step);
    }
    Ok(steps)
}

fn child_steps(obj: &Map<String, Value>, path: &str) -> Result<Vec<StepDefinition>> {
    match obj.get("steps") {
        Some(Value::Array(items)) if !items.is_empty() => {
            validate_steps(items, &field(path, "steps"))
        }
        Some(Value::Array(_)) | None | Some(Value::Null) => Err(ValidationError::new(
            field(path, "steps"),
            "at least one child step is required",
        )),
        Some(_) => Err(ValidationError::new(field(path, "steps"), "expected a list of steps")),
    }
}

/// Validate a single step (and, recursively, its children).
pub fn validate_step(value: &Value, path: &str) -> Result<StepDefinition> {
    let obj = as_object(value, path)?;

    let name = required_string(obj, path, "name", "step name")?;
    if !is_valid_name(&name) {
        return Err(ValidationError::new(
            field(path, "name"),
            format!("'{}' is not a valid step name (letters, digits, '-', '_', '.', ':')", name),
        ));
    }

    let output = optional_string(obj, path, "output")?;
    if let Some(ref binding) = output {
        if !is_valid_binding(binding) {
            return Err(ValidationError::new(
                field(path, "output"),
                format!("'{}' is not a usable binding name", binding),
            ));
        }
    }

    let enabled = optional_bool(obj, path, "enabled")?.unwrap_or(true);
    let visibility = match optional_string(obj, path, "visibility")? {
        None => Visibility::default(),
        Some(v) => Visibility::parse(&v).ok_or_else(|| {
            ValidationError::new(
                field(path, "visibility"),
                format!("unknown visibility '{}' (expected visible, silent or summary)", v),
            )
        })?,
    };

    let step_type = optional_string(obj, path, "type")?;
    let (kind, condition) = match step_type.as_deref() {
        None | Some("agent-prompt") => {
            reject_unknown(
                obj,
                path,
                &[COMMON_STEP_KEYS, &["agent", "prompt", "model", "input", "failWhen"]],
            )?;
            let agent = optional_string(obj, path, "agent")?;
            let prompt = match obj.get("prompt") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) if !s.trim().is_empty() => Some(PromptSource::Inline(s.clone())),
                Some(Value::Object(p)) => {
                    let prompt_path = field(path, "prompt");
                    reject_unknown(p, &prompt_path, &[&["file"]])?;
                    Some(PromptSource::File(required_string(p, &prompt_path, "file", "prompt file")?))
                }
                Some(_) => {
                    return Err(ValidationError::new(
                        field(path, "prompt"),
                        "expected inline prompt text or { file: <name> }",
                    ))
                }
            };
            if agent.is_none() && prompt.is_none() {
                return Err(ValidationError::new(
                    path,
                    "agent-prompt steps require an 'agent' or a 'prompt'",
                ));
            }
            let step = AgentPromptStep {
                agent,
                prompt,
                model: optional_string(obj, path, "model")?,
                input: check_expression(obj, path, "input")?,
                fail_when: check_expression(obj, path, "failWhen")?,
            };
            (StepKind::AgentPrompt(step), check_expression(obj, path, "condition")?)
        }
        Some("code") => {
            reject_unknown(obj, path, &[COMMON_STEP_KEYS, &["handler", "input"]])?;
            let step = CodeStep {
                handler: required_string(obj, path, "handler", "handler")?,
                input: check_expression(obj, path, "input")?,
            };
            (StepKind::Code(step), check_expression(obj, path, "condition")?)
        }
        Some(t @ ("parallel" | "gate-group")) => {
            reject_unknown(obj, path, &[COMMON_STEP_KEYS, &["steps", "minSeverity"]])?;
            let gate_group = t == "gate-group";
            let min_severity = match optional_string(obj, path, "minSeverity")? {
                None => None,
                Some(s) => Some(Severity::parse(&s).ok_or_else(|| {
                    ValidationError::new(
                        field(path, "minSeverity"),
                        format!("unknown severity '{}' (expected critical, important or minor)", s),
                    )
                })?),
            };
            let steps = child_steps(obj, path)?;
            for (i, child) in steps.iter().enumerate() {
                if !matches!(child.kind, StepKind::AgentPrompt(_)) {
                    return Err(ValidationError::new(
                        format!("{}.steps[{}].type", path, i),
                        format!("children of a {} step must be agent-prompt steps", t),
                    ));
                }
            }
            let step = ParallelStep {
                gate_group,
                min_severity,
                steps,
            };
            (StepKind::Parallel(step), check_expression(obj, path, "condition")?)
        }
        Some("loop") => {
            reject_unknown(obj, path, &[COMMON_STEP_KEYS, &["steps", "maxRetries", "onExhausted"]])?;
            let condition = required_string(obj, path, "condition", "loop condition")?;
            expression::parse(&condition).map_err(|e| {
                ValidationError::new(field(path, "condition"), format!("invalid expression: {}", e))
            })?;
            let max_retries = positive_integer(obj, path, "maxRetries")?
                .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
                .unwrap_or(DEFAULT_MAX_RETRIES);
            let on_exhausted = match optional_string(obj, path, "onExhausted")? {
                None => ExhaustionPolicy::default(),
                Some(p) => ExhaustionPolicy::parse(&p).ok_or_else(|| {
                    ValidationError::new(
                        field(path, "onExhausted"),
                        format!("unknown exhaustion policy '{}' (expected escalate, warn or fail)", p),
                    )
                })?,
            };
            let step = LoopStep {
                condition,
                max_retries,
                on_exhausted,
                steps: child_steps(obj, path)?,
            };
            (StepKind::Loop(step), None)
        }
        Some("per-task") => {
            reject_unknown(obj, path, &[COMMON_STEP_KEYS, &["steps", "source"]])?;
            let source = required_string(obj, path, "source", "per-task source")?;
            expression::parse(&source).map_err(|e| {
                ValidationError::new(field(path, "source"), format!("invalid expression: {}", e))
            })?;
            let step = PerTaskStep {
                source,
                steps: child_steps(obj, path)?,
            };
            (StepKind::PerTask(step), check_expression(obj, path, "condition")?)
        }
        Some(other) => {
            return Err(ValidationError::new(
                field(path, "type"),
                format!("unknown step type '{}'", other),
            ))
        }
    };

    Ok(StepDefinition {
        name,
        output,
        enabled,
        condition,
        visibility,
        kind,
    })
}
