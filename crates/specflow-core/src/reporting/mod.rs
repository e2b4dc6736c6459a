//! Reporting: fan-out of audit entries to external observers.
//!
//! The [`ReporterManager`] sits between the executor and the reporters:
//!
//! - step visibility is computed once from the definition tree; `silent`
//!   hides a step and everything under it, `summary` hides only the step
//!   itself and only until the final render;
//! - entries for silent steps are dropped before any reporter sees them;
//! - every reporter call is isolated. A failing reporter is logged and
//!   skipped for that event, and the workflow never notices.
//!
//! Reporters are created from [`ReporterSpec`]s through an explicit factory
//! table, so hosts decide which reporter types exist.

pub mod log;
pub mod pr_comment;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::workflow::audit::{ExecutionSummary, WorkflowAuditEntry};
use crate::workflow::schema::{child_path, ReporterSpec, StepDefinition, Visibility, WorkflowDefinition};

pub use self::log::LogReporter;
pub use self::pr_comment::{
    CommentSurface, GitHubCommentSurface, PrCommentConfig, PrCommentReporter, SurfaceError,
};

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("unknown reporter type '{0}'")]
    UnknownType(String),

    #[error("invalid reporter config: {0}")]
    Config(String),

    /// A surface call failed. The message has already been redacted.
    #[error("progress surface: {0}")]
    Surface(String),
}

/// Facts about the run handed to reporters at initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub workflow: String,
    pub run_id: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, run: &RunInfo) -> Result<(), ReporterError>;

    /// Called for every non-silent entry, in emission order.
    async fn on_entry(
        &self,
        entry: &WorkflowAuditEntry,
        visibility: Visibility,
    ) -> Result<(), ReporterError>;

    async fn on_complete(&self, summary: &ExecutionSummary, success: bool) -> Result<(), ReporterError>;

    async fn on_error(&self, message: &str) -> Result<(), ReporterError>;
}

pub type ReporterFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Box<dyn Reporter>, ReporterError> + Send + Sync>;

/// Reporter type name to constructor.
#[derive(Clone, Default)]
pub struct ReporterFactories {
    factories: HashMap<String, ReporterFactory>,
}

impl ReporterFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `pr-comment` (GitHub) and `log`.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("pr-comment", |config| {
            let config = PrCommentConfig::from_map(config)?;
            let surface = GitHubCommentSurface::new(&config);
            Ok(Box::new(PrCommentReporter::new(config, Box::new(surface))) as Box<dyn Reporter>)
        });
        table.register("log", |_| Ok(Box::new(LogReporter::new()) as Box<dyn Reporter>));
        table
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Box<dyn Reporter>, ReporterError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn create(&self, kind: &str, config: &Map<String, Value>) -> Result<Box<dyn Reporter>, ReporterError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ReporterError::UnknownType(kind.to_string()))?;
        factory(config)
    }
}

/// Visibility of every step path in the tree.
pub fn compute_visibility(workflow: &WorkflowDefinition) -> HashMap<String, Visibility> {
    fn go(steps: &[StepDefinition], parent: &str, inherited_silent: bool, out: &mut HashMap<String, Visibility>) {
        for step in steps {
            let path = child_path(parent, &step.name);
            let silent = inherited_silent || step.visibility == Visibility::Silent;
            let visibility = if silent { Visibility::Silent } else { step.visibility };
            out.insert(path.clone(), visibility);
            go(step.children(), &path, silent, out);
        }
    }
    let mut out = HashMap::new();
    go(&workflow.phases, "", false, &mut out);
    out
}

/// Context keys reporter configs may reference as `{{context.NAME}}`.
pub const CONFIG_CONTEXT_KEYS: &[&str] = &[
    "sessionId",
    "specPath",
    "branch",
    "worktreePath",
    "prNumber",
    "prUrl",
];

fn is_numeric(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.chars().filter(|c| *c == '.').count() <= 1
        && !digits.starts_with('.')
        && !digits.ends_with('.')
}

fn coerce(s: String) -> Value {
    if is_numeric(&s) {
        if let Ok(n) = s.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(f) = s.parse::<f64>() {
            return Value::from(f);
        }
    }
    Value::String(s)
}

fn resolve_string(raw: &str, re: &Regex, env: &dyn Fn(&str) -> Option<String>, context: &Value) -> Value {
    let resolved = re.replace_all(raw, |caps: &regex::Captures| {
        let (source, name) = (&caps[1], &caps[2]);
        let value = match source {
            "env" => env(name),
            _ if CONFIG_CONTEXT_KEYS.contains(&name) => context.get(name).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }),
            _ => {
                tracing::warn!("[ReporterManager] context.{} is not available to reporter config", name);
                None
            }
        };
        value.unwrap_or_else(|| {
            tracing::debug!("[ReporterManager] {}.{} is unset", source, name);
            String::new()
        })
    });
    coerce(resolved.into_owned())
}

fn resolve_value(value: &Value, re: &Regex, env: &dyn Fn(&str) -> Option<String>, context: &Value) -> Value {
    match value {
        Value::String(s) => resolve_string(s, re, env, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, re, env, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, re, env, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute `{{env.NAME}}` and `{{context.NAME}}` in every string of a
/// reporter config. Unset references become empty; purely numeric results
/// become numbers.
pub fn resolve_config(
    config: &Map<String, Value>,
    env: &dyn Fn(&str) -> Option<String>,
    context: &Value,
) -> Map<String, Value> {
    let re = match Regex::new(r"\{\{\s*(env|context)\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}") {
        Ok(re) => re,
        Err(e) => {
            tracing::error!("[ReporterManager] config pattern failed to compile: {}", e);
            return config.clone();
        }
    };
    config
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, &re, env, context)))
        .collect()
}

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Routes audit entries to the initialized reporters.
pub struct ReporterManager {
    reporters: Vec<Box<dyn Reporter>>,
    visibility: HashMap<String, Visibility>,
}

impl ReporterManager {
    pub fn new(visibility: HashMap<String, Visibility>) -> Self {
        Self {
            reporters: Vec::new(),
            visibility,
        }
    }

    /// Build and initialize the reporters a workflow declares. Unknown
    /// types and failed initializations are logged and left out.
    pub async fn from_specs(
        specs: &[ReporterSpec],
        factories: &ReporterFactories,
        visibility: HashMap<String, Visibility>,
        run: &RunInfo,
        context: &Value,
    ) -> Self {
        let mut manager = Self::new(visibility);
        for spec in specs.iter().filter(|s| s.enabled) {
            let config = resolve_config(&spec.config, &process_env, context);
            match factories.create(&spec.kind, &config) {
                Ok(reporter) => manager.add(reporter, run).await,
                Err(e) => tracing::warn!("[ReporterManager] Skipping reporter '{}': {}", spec.kind, e),
            }
        }
        manager
    }

    /// Initialize `reporter` and keep it if that succeeds.
    pub async fn add(&mut self, reporter: Box<dyn Reporter>, run: &RunInfo) {
        match reporter.initialize(run).await {
            Ok(()) => {
                tracing::info!("[ReporterManager] Reporter '{}' initialized", reporter.name());
                self.reporters.push(reporter);
            }
            Err(e) => tracing::warn!(
                "[ReporterManager] Reporter '{}' failed to initialize: {}",
                reporter.name(),
                e
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    pub fn visibility_of(&self, path: &str) -> Visibility {
        self.visibility.get(path).copied().unwrap_or_default()
    }

    pub async fn dispatch(&self, entry: &WorkflowAuditEntry) {
        let visibility = self.visibility_of(&entry.path);
        if visibility == Visibility::Silent {
            return;
        }
        for reporter in &self.reporters {
            if let Err(e) = reporter.on_entry(entry, visibility).await {
                tracing::warn!(
                    "[ReporterManager] Reporter '{}' failed on {} {}: {}",
                    reporter.name(),
                    entry.path,
                    entry.status.as_str(),
                    e
                );
            }
        }
    }

    pub async fn complete(&self, summary: &ExecutionSummary, success: bool) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.on_complete(summary, success).await {
                tracing::warn!("[ReporterManager] Reporter '{}' failed on completion: {}", reporter.name(), e);
            }
        }
    }

    pub async fn error(&self, message: &str) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.on_error(message).await {
                tracing::warn!("[ReporterManager] Reporter '{}' failed on error: {}", reporter.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::audit::AuditStatus;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Arc<Mutex<Vec<(String, Visibility)>>>,
        fail_init: bool,
        fail_entries: bool,
    }

    #[async_trait]
    impl Reporter for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn initialize(&self, _run: &RunInfo) -> Result<(), ReporterError> {
            if self.fail_init {
                return Err(ReporterError::Config("no token".into()));
            }
            Ok(())
        }

        async fn on_entry(&self, entry: &WorkflowAuditEntry, visibility: Visibility) -> Result<(), ReporterError> {
            if self.fail_entries {
                return Err(ReporterError::Config("broken".into()));
            }
            self.seen.lock().unwrap().push((entry.path.clone(), visibility));
            Ok(())
        }

        async fn on_complete(&self, _summary: &ExecutionSummary, _success: bool) -> Result<(), ReporterError> {
            Ok(())
        }

        async fn on_error(&self, _message: &str) -> Result<(), ReporterError> {
            Ok(())
        }
    }

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(
            r#"
name: vis
version: 1
phases:
  - name: setup
    visibility: silent
    type: per-task
    source: tasks
    steps:
      - { name: inner, agent: a, visibility: visible }
  - name: review
    type: gate-group
    visibility: summary
    steps:
      - { name: security, agent: s }
  - name: fix
    agent: f
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_silent_propagates_summary_does_not() {
        let vis = compute_visibility(&workflow());
        assert_eq!(vis["setup"], Visibility::Silent);
        assert_eq!(vis["setup/inner"], Visibility::Silent);
        assert_eq!(vis["review"], Visibility::Summary);
        assert_eq!(vis["review/security"], Visibility::Visible);
        assert_eq!(vis["fix"], Visibility::Visible);
    }

    #[tokio::test]
    async fn test_dispatch_drops_silent_and_isolates_failures() {
        let run = RunInfo {
            workflow: "vis".into(),
            run_id: "r1".into(),
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ReporterManager::new(compute_visibility(&workflow()));
        manager
            .add(Box::new(Recording { fail_entries: true, ..Default::default() }), &run)
            .await;
        manager
            .add(Box::new(Recording { fail_init: true, ..Default::default() }), &run)
            .await;
        manager
            .add(Box::new(Recording { seen: seen.clone(), ..Default::default() }), &run)
            .await;
        assert_eq!(manager.len(), 2);

        for path in ["setup", "setup/inner", "review", "fix"] {
            manager
                .dispatch(&WorkflowAuditEntry::new(path, AuditStatus::Started, None))
                .await;
        }
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("review".to_string(), Visibility::Summary),
                ("fix".to_string(), Visibility::Visible)
            ]
        );
    }

    #[test]
    fn test_resolve_config_env_context_and_numbers() {
        let config = json!({
            "owner": "{{env.OWNER}}",
            "issueNumber": "{{context.prNumber}}",
            "label": "run {{context.sessionId}}",
            "missing": "{{env.NOPE}}",
            "secret": "{{context.apiKey}}",
            "nested": { "debounceMs": "{{ env.DEBOUNCE }}" }
        });
        let env = |name: &str| match name {
            "OWNER" => Some("acme".to_string()),
            "DEBOUNCE" => Some("250".to_string()),
            _ => None,
        };
        let context = json!({ "prNumber": "42", "sessionId": "abc", "apiKey": "k" });
        let resolved = resolve_config(config.as_object().unwrap(), &env, &context);
        assert_eq!(resolved["owner"], json!("acme"));
        assert_eq!(resolved["issueNumber"], json!(42));
        assert_eq!(resolved["label"], json!("run abc"));
        assert_eq!(resolved["missing"], json!(""));
        assert_eq!(resolved["secret"], json!(""));
        assert_eq!(resolved["nested"]["debounceMs"], json!(250));
    }

    #[test]
    fn test_factory_table() {
        let table = ReporterFactories::with_builtins();
        assert!(table.create("log", &Map::new()).is_ok());
        assert!(matches!(
            table.create("slack", &Map::new()),
            Err(ReporterError::UnknownType(_))
        ));
        assert!(matches!(
            table.create("pr-comment", &Map::new()),
            Err(ReporterError::Config(_))
        ));
    }

    #[test]
    fn test_numeric_detection() {
        assert!(is_numeric("42"));
        assert!(is_numeric("-3.5"));
        assert!(!is_numeric("4a"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("1.2.3"));
        assert!(!is_numeric("."));
    }
}
