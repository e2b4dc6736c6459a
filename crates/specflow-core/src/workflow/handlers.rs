//! Code-step handlers.
//!
//! A handler is a plain function from the step's resolved input to its
//! output. Hosts register their own next to the builtins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Handler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `identity` and `tasks.order` installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("identity", |input| Ok(input));
        registry.register("tasks.order", order_tasks);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// A unit of implementation work produced by spec analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Requirement ids from the spec this task covers
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Ids of tasks that must be done first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// Files the task is expected to touch
    #[serde(default)]
    pub files: Vec<String>,
}

/// Validate a task list (bare, or under `tasks`) and order it so every task
/// follows its dependencies. Ties keep their original order.
pub fn order_tasks(input: Value) -> Result<Value, String> {
    let list = match input {
        Value::Array(_) => input,
        Value::Object(mut map) => map
            .remove("tasks")
            .ok_or_else(|| "expected a task list or an object with 'tasks'".to_string())?,
        other => return Err(format!("expected a task list, found {}", other)),
    };
    let tasks: Vec<TaskDefinition> =
        serde_json::from_value(list).map_err(|e| format!("invalid task list: {}", e))?;

    let mut ids = HashSet::new();
    for task in &tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(format!("duplicate task id '{}'", task.id));
        }
    }
    for task in &tasks {
        if let Some(dep) = task.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(format!("task '{}' depends on unknown task '{}'", task.id, dep));
        }
    }

    let mut placed: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<&TaskDefinition> = Vec::with_capacity(tasks.len());
    while ordered.len() < tasks.len() {
        let next = tasks.iter().find(|t| {
            !placed.contains(t.id.as_str())
                && t.dependencies.iter().all(|d| placed.contains(d.as_str()))
        });
        match next {
            Some(task) => {
                placed.insert(task.id.as_str());
                ordered.push(task);
            }
            None => {
                let stuck: Vec<&str> = tasks
                    .iter()
                    .filter(|t| !placed.contains(t.id.as_str()))
                    .map(|t| t.id.as_str())
                    .collect();
                return Err(format!("dependency cycle among tasks: {}", stuck.join(", ")));
            }
        }
    }

    serde_json::to_value(ordered).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(value: &Value) -> Vec<String> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_orders_by_dependencies() {
        let out = order_tasks(json!([
            { "id": "T3", "title": "wire", "dependencies": ["T1", "T2"] },
            { "id": "T1", "title": "model" },
            { "id": "T2", "title": "api", "dependencies": ["T1"], "complexity": "moderate" }
        ]))
        .unwrap();
        assert_eq!(ids(&out), vec!["T1", "T2", "T3"]);
        assert_eq!(out[1]["complexity"], "moderate");
    }

    #[test]
    fn test_accepts_wrapped_list() {
        let out = order_tasks(json!({ "tasks": [{ "id": "A", "title": "a" }] })).unwrap();
        assert_eq!(ids(&out), vec!["A"]);
    }

    #[test]
    fn test_rejects_cycles_and_unknown_ids() {
        let err = order_tasks(json!([
            { "id": "A", "title": "a", "dependencies": ["B"] },
            { "id": "B", "title": "b", "dependencies": ["A"] }
        ]))
        .unwrap_err();
        assert!(err.contains("cycle"));

        let err = order_tasks(json!([{ "id": "A", "title": "a", "dependencies": ["Z"] }])).unwrap_err();
        assert!(err.contains("unknown task 'Z'"));

        let err = order_tasks(json!([{ "id": "A", "title": "a" }, { "id": "A", "title": "b" }])).unwrap_err();
        assert!(err.contains("duplicate"));

        assert!(order_tasks(json!("nope")).is_err());
    }

    #[test]
    fn test_registry_builtins() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["identity", "tasks.order"]);
        let identity = registry.get("identity").unwrap();
        assert_eq!(identity(json!({ "a": 1 })).unwrap(), json!({ "a": 1 }));
        assert!(registry.get("missing").is_none());
    }
}
