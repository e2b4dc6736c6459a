//! `specflow workflow`: run, validate and inspect YAML-defined workflows.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use specflow_core::workflow::agent::AgentQuery;
use specflow_core::workflow::agent_caller::{MessagesApiAgent, MessagesApiConfig};
use specflow_core::workflow::audit::AuditStatus;
use specflow_core::workflow::definitions::DefinitionKind;
use specflow_core::workflow::executor::{WorkflowExecutor, WorkflowOutcome};
use specflow_core::workflow::schema::WorkflowDefinition;

use super::{parse_params, print_json, truncate, DefinitionDirs};

/// Options for `workflow run`, as parsed by clap.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub params: Vec<String>,
    pub spec: Option<String>,
    pub dirs: DefinitionDirs,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub json: bool,
}

impl RunOptions {
    /// Invocation parameters, with `--spec` folded in as `specPath`.
    pub fn invocation_params(&self) -> Result<Map<String, Value>, String> {
        let mut params = parse_params(&self.params)?;
        if let Some(ref spec) = self.spec {
            params.insert("specPath".to_string(), Value::String(spec.clone()));
        }
        Ok(params)
    }

    fn agent_config(&self) -> Result<MessagesApiConfig, String> {
        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_AUTH_TOKEN").ok())
            .filter(|k| !k.is_empty())
            .ok_or("ANTHROPIC_API_KEY (or ANTHROPIC_AUTH_TOKEN) is not set")?;

        let mut config = MessagesApiConfig {
            api_key,
            ..MessagesApiConfig::default()
        };
        if let Some(ref url) = self.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        Ok(config)
    }
}

fn load(workflow_file: &str) -> Result<WorkflowDefinition, String> {
    WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())
}

/// Load and execute a workflow file against `agent`.
pub async fn execute(
    workflow_file: &str,
    params: Map<String, Value>,
    dirs: &DefinitionDirs,
    agent: Arc<dyn AgentQuery>,
) -> Result<WorkflowOutcome, String> {
    let workflow = load(workflow_file)?;
    tracing::info!(
        "[Workflow] Loaded '{}' from {} ({} phases)",
        workflow.name,
        workflow_file,
        workflow.phases.len()
    );
    let executor = WorkflowExecutor::new(agent).with_locator(dirs.locator());
    Ok(executor.execute(&workflow, params).await)
}

/// Run a workflow from a YAML file.
pub async fn run(workflow_file: &str, options: RunOptions) -> Result<(), String> {
    let params = options.invocation_params()?;
    let config = options.agent_config()?;
    tracing::info!(
        "[Workflow] Using Messages API at {} (default model: {})",
        config.base_url,
        config.model
    );
    let agent = Arc::new(MessagesApiAgent::new(config));

    let outcome = execute(workflow_file, params, &options.dirs, agent).await?;

    if options.json {
        print_json(&outcome_json(&outcome));
    } else {
        print_outcome(&outcome);
    }

    match outcome.error {
        None => Ok(()),
        Some(ref error) => Err(format!(
            "Workflow failed at step '{}': {}",
            outcome.failed_step().unwrap_or("<workflow>"),
            error
        )),
    }
}

/// Machine-readable form of a run outcome.
pub fn outcome_json(outcome: &WorkflowOutcome) -> Value {
    json!({
        "runId": outcome.run_id,
        "success": outcome.success,
        "failedStep": outcome.failed_step(),
        "error": outcome.error.as_ref().map(|e| e.to_string()),
        "summary": outcome.summary,
        "escalations": outcome.escalations,
        "audit": outcome.audit,
        "context": outcome.context,
    })
}

fn status_icon(status: AuditStatus) -> &'static str {
    match status {
        AuditStatus::Completed => "✅",
        AuditStatus::Failed => "❌",
        AuditStatus::Skipped => "⏭",
        AuditStatus::Started => "▶",
    }
}

fn print_outcome(outcome: &WorkflowOutcome) {
    let summary = &outcome.summary;
    println!();
    println!("┌──────────────────────────────────────────┬──────┬────────────┐");
    println!("│ Step                                     │      │ Duration   │");
    println!("├──────────────────────────────────────────┼──────┼────────────┤");
    for step in &summary.steps {
        let name = match step.task_index {
            Some(i) => format!("{} [{}]", step.path, i + 1),
            None => step.path.clone(),
        };
        let duration = step
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_default();
        println!(
            "│ {:<40} │ {:<4} │ {:>10} │",
            truncate(&name, 40),
            status_icon(step.status),
            duration
        );
    }
    println!("└──────────────────────────────────────────┴──────┴────────────┘");
    println!(
        "   {} completed, {} failed, {} skipped, {} escalated in {}ms",
        summary.completed, summary.failed, summary.skipped, summary.escalated, summary.total_duration_ms
    );
    for escalation in &outcome.escalations {
        println!(
            "   ⚠️  {} needs attention: '{}' still holds after {} iterations",
            escalation.path, escalation.condition, escalation.iterations
        );
    }
    if outcome.success {
        println!("\n🎉 Workflow completed successfully!");
    }
}

/// One line per step, indented by depth.
pub fn describe(workflow: &WorkflowDefinition) -> Vec<String> {
    let mut lines = Vec::new();
    workflow.walk(|_, depth, step| {
        let mut line = format!("{}- {} ({})", "  ".repeat(depth), step.name, step.type_name());
        if let Some(ref output) = step.output {
            line.push_str(&format!(" → {}", output));
        }
        if !step.enabled {
            line.push_str(" [disabled]");
        }
        lines.push(line);
    });
    lines
}

/// Validate a workflow YAML file without executing it.
pub fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = load(workflow_file)?;

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Version: {}", workflow.version);
    if let Some(ref description) = workflow.description {
        println!("   Description: {}", description);
    }
    println!("   Phases: {}", workflow.phases.len());
    if !workflow.reporters.is_empty() {
        let kinds: Vec<&str> = workflow.reporters.iter().map(|r| r.kind.as_str()).collect();
        println!("   Reporters: {}", kinds.join(", "));
    }
    for line in describe(&workflow) {
        println!("   {}", line);
    }
    Ok(())
}

/// List resolvable definitions and the tier each one comes from.
pub fn agents(dirs: &DefinitionDirs) -> Result<(), String> {
    let locator = dirs.locator();

    println!("┌──────────┬──────────────────────────┬──────────┐");
    println!("│ Kind     │ Name                     │ Tier     │");
    println!("├──────────┼──────────────────────────┼──────────┤");
    let mut total = 0;
    for kind in DefinitionKind::ALL {
        for definition in locator.list(kind) {
            total += 1;
            println!(
                "│ {:<8} │ {:<24} │ {:<8} │",
                kind.label(),
                truncate(&definition.name, 24),
                definition.tier.as_str()
            );
        }
    }
    println!("└──────────┴──────────────────────────┴──────────┘");
    println!("   {} definition(s)", total);
    Ok(())
}
