//! Execution context: the append-only binding map a workflow run threads
//! through its steps.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::StepError;
use crate::workflow::template::{lookup_segments, Scope, RESERVED_SEGMENTS};

/// Owner recorded for bindings seeded from invocation parameters.
pub const PARAMS_OWNER: &str = "<params>";

/// Binding map owned by the executor.
///
/// A binding belongs to the step that first wrote it; only that step may
/// write it again (loop bodies re-run). Per-task iterations push a scope
/// overlay: writes made while an overlay is active land in the overlay and
/// are returned by [`ExecutionContext::pop_scope`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: Map<String, Value>,
    owners: HashMap<String, String>,
    scopes: Vec<Map<String, Value>>,
}

impl ExecutionContext {
    pub fn new(params: Map<String, Value>) -> Self {
        let owners = params
            .keys()
            .map(|k| (k.clone(), PARAMS_OWNER.to_string()))
            .collect();
        Self {
            values: params,
            owners,
            scopes: Vec::new(),
        }
    }

    /// Bind `key` on behalf of the step at `owner`.
    pub fn bind(&mut self, owner: &str, key: &str, value: Value) -> Result<(), StepError> {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(key.to_string(), value);
            return Ok(());
        }
        match self.owners.get(key) {
            Some(existing) if existing != owner => {
                return Err(StepError::BindingConflict {
                    key: key.to_string(),
                    owner: existing.clone(),
                })
            }
            Some(_) => {}
            None => {
                self.owners.insert(key.to_string(), owner.to_string());
            }
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(key))
            .or_else(|| self.values.get(key))
    }

    pub fn push_scope(&mut self, overlay: Map<String, Value>) {
        self.scopes.push(overlay);
    }

    pub fn pop_scope(&mut self) -> Option<Map<String, Value>> {
        self.scopes.pop()
    }

    /// Flattened copy with overlays applied, for reporters and results.
    pub fn snapshot(&self) -> Value {
        let mut merged = self.values.clone();
        for scope in &self.scopes {
            for (k, v) in scope {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }

    /// Scope that sees `output`'s fields (and `output` itself) ahead of the
    /// context. Used to evaluate `failWhen`.
    pub fn with_output<'a>(&'a self, output: &'a Value) -> OutputScope<'a> {
        OutputScope {
            context: self,
            output,
        }
    }
}

impl Scope for ExecutionContext {
    fn lookup(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let (first, rest) = segments.split_first()?;
        if RESERVED_SEGMENTS.contains(first) {
            return None;
        }
        lookup_segments(self.get(first)?, rest)
    }
}

pub struct OutputScope<'a> {
    context: &'a ExecutionContext,
    output: &'a Value,
}

impl Scope for OutputScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if path == "output" {
            return Some(self.output.clone());
        }
        if let Some(rest) = path.strip_prefix("output.") {
            let segments: Vec<&str> = rest.split('.').collect();
            return lookup_segments(self.output, &segments);
        }
        if self.output.is_object() {
            if let Some(v) = self.output.lookup(path) {
                return Some(v);
            }
        }
        self.context.lookup(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> Map<String, Value> {
        json!({ "specPath": "spec.md" }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_seeded_params_are_protected() {
        let mut ctx = ExecutionContext::new(params());
        let err = ctx.bind("analyze", "specPath", json!("other.md")).unwrap_err();
        assert!(matches!(err, StepError::BindingConflict { ref owner, .. } if owner == PARAMS_OWNER));
        assert_eq!(ctx.get("specPath"), Some(&json!("spec.md")));
    }

    #[test]
    fn test_owner_may_rebind() {
        let mut ctx = ExecutionContext::new(Map::new());
        ctx.bind("loop/review", "review", json!({ "v": 1 })).unwrap();
        ctx.bind("loop/review", "review", json!({ "v": 2 })).unwrap();
        assert_eq!(ctx.lookup("review.v"), Some(json!(2)));
        assert!(ctx.bind("other", "review", json!(null)).is_err());
    }

    #[test]
    fn test_scope_overlay_collects_bindings() {
        let mut ctx = ExecutionContext::new(params());
        ctx.push_scope(json!({ "task": { "id": "T1" } }).as_object().cloned().unwrap());
        ctx.bind("per-task/implement", "impl", json!("done")).unwrap();
        assert_eq!(ctx.lookup("task.id"), Some(json!("T1")));
        assert_eq!(ctx.lookup("impl"), Some(json!("done")));

        let popped = ctx.pop_scope().unwrap();
        assert_eq!(popped.get("impl"), Some(&json!("done")));
        assert_eq!(ctx.get("impl"), None);
        assert_eq!(ctx.get("task"), None);
    }

    #[test]
    fn test_output_scope_precedence() {
        let ctx = ExecutionContext::new(params());
        let output = json!({ "tasks": [] });
        let scope = ctx.with_output(&output);
        assert_eq!(scope.lookup("tasks.length"), Some(json!(0)));
        assert_eq!(scope.lookup("output.tasks"), Some(json!([])));
        assert_eq!(scope.lookup("specPath"), Some(json!("spec.md")));
    }
}
