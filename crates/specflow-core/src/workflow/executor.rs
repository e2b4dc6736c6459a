//! Workflow Executor: walks a validated step tree depth-first.
//!
//! The executor:
//! 1. Seeds the execution context with the invocation parameters
//! 2. Builds the reporters the workflow declares
//! 3. Runs each step in order, emitting `started` and then exactly one
//!    terminal audit entry for it
//! 4. Binds step outputs into the context for later steps
//! 5. Stops at the first failure no loop policy absorbs
//!
//! Agent-prompt steps go through the injected [`AgentQuery`]; code steps go
//! through the [`HandlerRegistry`]. Parallel children run concurrently
//! against a snapshot of the context and are merged back in declaration
//! order once all of them have settled.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{StepError, WorkflowError};
use crate::reporting::{compute_visibility, ReporterFactories, ReporterManager, RunInfo};
use crate::review::{aggregate, ReviewResult};
use crate::workflow::agent::{collect_result, AgentQuery, AgentRequest};
use crate::workflow::audit::{AuditStatus, ExecutionSummary, WorkflowAuditEntry};
use crate::workflow::context::ExecutionContext;
use crate::workflow::definitions::{AgentDefinition, DefinitionLocator};
use crate::workflow::expression;
use crate::workflow::handlers::HandlerRegistry;
use crate::workflow::schema::{
    child_path, AgentPromptStep, CodeStep, ExhaustionPolicy, LoopStep, ParallelStep, PerTaskStep,
    PromptSource, StepDefinition, StepKind, WorkflowDefinition,
};
use crate::workflow::template::{self, lookup_segments, Scope};

/// A loop that ran out of retries under the `escalate` policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub path: String,
    pub condition: String,
    pub iterations: u32,
}

/// Everything a run leaves behind.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub run_id: String,
    pub success: bool,
    pub error: Option<WorkflowError>,
    pub audit: Vec<WorkflowAuditEntry>,
    pub summary: ExecutionSummary,
    /// Final context bindings
    pub context: Value,
    pub escalations: Vec<Escalation>,
}

impl WorkflowOutcome {
    pub fn failed_step(&self) -> Option<&str> {
        self.error.as_ref().and_then(WorkflowError::step_path)
    }

    /// Entries for one step path, in emission order.
    pub fn entries_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a WorkflowAuditEntry> + 'a {
        self.audit.iter().filter(move |e| e.path == path)
    }
}

/// The workflow executor engine.
pub struct WorkflowExecutor {
    agent: Arc<dyn AgentQuery>,
    handlers: HandlerRegistry,
    locator: DefinitionLocator,
    reporters: ReporterFactories,
}

impl WorkflowExecutor {
    /// Executor with the builtin handlers and reporter types and no
    /// definition directories.
    pub fn new(agent: Arc<dyn AgentQuery>) -> Self {
        Self {
            agent,
            handlers: HandlerRegistry::with_builtins(),
            locator: DefinitionLocator::default(),
            reporters: ReporterFactories::with_builtins(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_locator(mut self, locator: DefinitionLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_reporters(mut self, reporters: ReporterFactories) -> Self {
        self.reporters = reporters;
        self
    }

    pub fn locator(&self) -> &DefinitionLocator {
        &self.locator
    }

    /// Execute a workflow definition. Failures are reported in the outcome,
    /// never as a panic or an `Err`.
    pub async fn execute(&self, workflow: &WorkflowDefinition, params: Map<String, Value>) -> WorkflowOutcome {
        let run_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut config_context = params.clone();
        config_context
            .entry("sessionId")
            .or_insert_with(|| Value::String(run_id.clone()));

        let info = RunInfo {
            workflow: workflow.name.clone(),
            run_id: run_id.clone(),
        };
        let reporters = ReporterManager::from_specs(
            &workflow.reporters,
            &self.reporters,
            compute_visibility(workflow),
            &info,
            &Value::Object(config_context),
        )
        .await;

        tracing::info!(
            "[Executor] Starting workflow '{}' v{} (run {}, {} phases, {} reporters)",
            workflow.name,
            workflow.version,
            run_id,
            workflow.phases.len(),
            reporters.len()
        );

        let run = Run {
            executor: self,
            workflow,
            emitter: Emitter::new(reporters),
            escalations: Mutex::new(Vec::new()),
        };
        let mut ctx = ExecutionContext::new(params);

        let result = match workflow.safety.workflow_timeout_secs {
            Some(secs) => {
                let steps = run.run_steps(&workflow.phases, "", &mut ctx, None);
                match tokio::time::timeout(Duration::from_secs(secs), steps).await {
                    Ok(result) => result,
                    Err(_) => {
                        let error = WorkflowError::Timeout { secs };
                        tracing::error!("[Executor] {}", error);
                        run.emitter.fail_open(&error.to_string()).await;
                        Err(error)
                    }
                }
            }
            None => run.run_steps(&workflow.phases, "", &mut ctx, None).await,
        };

        let audit = run.emitter.entries();
        let summary = ExecutionSummary::from_entries(&audit);
        if let Err(ref e) = result {
            run.emitter.reporters.error(&e.to_string()).await;
        }
        run.emitter.reporters.complete(&summary, result.is_ok()).await;

        match result {
            Ok(()) => tracing::info!(
                "[Executor] Workflow '{}' completed: {} completed, {} skipped, {} escalated",
                workflow.name,
                summary.completed,
                summary.skipped,
                summary.escalated
            ),
            Err(ref e) => tracing::error!("[Executor] Workflow '{}' failed: {}", workflow.name, e),
        }

        let escalations = std::mem::take(&mut *lock(&run.escalations));
        WorkflowOutcome {
            run_id,
            success: result.is_ok(),
            error: result.err(),
            audit,
            summary,
            context: ctx.snapshot(),
            escalations,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Position inside the innermost per-task step.
#[derive(Debug, Clone, Copy)]
struct TaskPosition {
    index: usize,
    count: usize,
}

fn metadata(task: Option<TaskPosition>, mut extra: Map<String, Value>) -> Option<Value> {
    if let Some(t) = task {
        extra.insert("taskIndex".into(), Value::from(t.index));
        extra.insert("taskCount".into(), Value::from(t.count));
    }
    if extra.is_empty() {
        None
    } else {
        Some(Value::Object(extra))
    }
}

/// Appends audit entries and forwards them to the reporters. Tracks steps
/// that started but have not finished so a workflow timeout can close them.
struct Emitter {
    audit: Mutex<Vec<WorkflowAuditEntry>>,
    open: Mutex<Vec<(String, Option<TaskPosition>)>>,
    reporters: ReporterManager,
}

impl Emitter {
    fn new(reporters: ReporterManager) -> Self {
        Self {
            audit: Mutex::new(Vec::new()),
            open: Mutex::new(Vec::new()),
            reporters,
        }
    }

    async fn emit(&self, path: &str, status: AuditStatus, metadata: Option<Value>) {
        let entry = WorkflowAuditEntry::new(path, status, metadata);
        lock(&self.audit).push(entry.clone());
        self.reporters.dispatch(&entry).await;
    }

    fn close(&self, path: &str) {
        let mut open = lock(&self.open);
        if let Some(i) = open.iter().rposition(|(p, _)| p == path) {
            open.remove(i);
        }
    }

    async fn started(&self, path: &str, task: Option<TaskPosition>) {
        lock(&self.open).push((path.to_string(), task));
        self.emit(path, AuditStatus::Started, metadata(task, Map::new()))
            .await;
    }

    async fn completed(&self, path: &str, task: Option<TaskPosition>, extra: Map<String, Value>) {
        self.close(path);
        self.emit(path, AuditStatus::Completed, metadata(task, extra))
            .await;
    }

    async fn failed(&self, path: &str, task: Option<TaskPosition>, error: &str) {
        self.failed_with(path, task, error, Map::new()).await;
    }

    async fn failed_with(
        &self,
        path: &str,
        task: Option<TaskPosition>,
        error: &str,
        mut extra: Map<String, Value>,
    ) {
        self.close(path);
        extra.insert("error".into(), Value::String(error.to_string()));
        self.emit(path, AuditStatus::Failed, metadata(task, extra)).await;
    }

    async fn skipped(&self, path: &str, task: Option<TaskPosition>, reason: &str) {
        let mut extra = Map::new();
        extra.insert("reason".into(), Value::String(reason.to_string()));
        self.emit(path, AuditStatus::Skipped, metadata(task, extra)).await;
    }

    /// Fail every open step, innermost first.
    async fn fail_open(&self, error: &str) {
        let open = std::mem::take(&mut *lock(&self.open));
        for (path, task) in open.into_iter().rev() {
            let mut extra = Map::new();
            extra.insert("error".into(), Value::String(error.to_string()));
            self.emit(&path, AuditStatus::Failed, metadata(task, extra)).await;
        }
    }

    fn entries(&self) -> Vec<WorkflowAuditEntry> {
        lock(&self.audit).clone()
    }
}

/// How a step failed: on its own, because a child did, or because
/// `failWhen` rejected the output it produced.
enum Failure {
    Own(StepError),
    Nested { own: StepError, cause: WorkflowError },
    Rejected { own: StepError, result: Value },
}

fn result_meta(result: Value) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("result".into(), result);
    meta
}

impl From<StepError> for Failure {
    fn from(e: StepError) -> Self {
        Failure::Own(e)
    }
}

type StepResult = Result<Map<String, Value>, Failure>;

fn eval(expr: &str, scope: &dyn Scope) -> Result<Value, StepError> {
    expression::evaluate_str(expr, scope).map_err(|source| StepError::Expression {
        expression: expr.to_string(),
        source,
    })
}

fn truthy(expr: &str, scope: &dyn Scope) -> Result<bool, StepError> {
    expression::evaluate_truthy(expr, scope).map_err(|source| StepError::Expression {
        expression: expr.to_string(),
        source,
    })
}

/// Why a step should be skipped, if it should.
fn entry_gate(step: &StepDefinition, scope: &dyn Scope) -> Result<Option<&'static str>, StepError> {
    if !step.enabled {
        return Ok(Some("disabled"));
    }
    match step.condition {
        Some(ref condition) if !truthy(condition, scope)? => Ok(Some("condition not met")),
        _ => Ok(None),
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn changed_files(ctx: &ExecutionContext) -> Option<Vec<String>> {
    ctx.get("changedFiles")?.as_array().map(|files| {
        files
            .iter()
            .filter_map(|f| f.as_str().map(str::to_string))
            .collect()
    })
}

/// Context plus the step's resolved `input`.
struct InputScope<'a> {
    context: &'a ExecutionContext,
    input: Option<&'a Value>,
}

impl Scope for InputScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(input) = self.input {
            if path == "input" {
                return Some(input.clone());
            }
            if let Some(rest) = path.strip_prefix("input.") {
                let segments: Vec<&str> = rest.split('.').collect();
                return lookup_segments(input, &segments);
            }
        }
        self.context.lookup(path)
    }
}

enum ChildPlan {
    Skip(&'static str),
    Fail(StepError),
    Run(Option<AgentDefinition>),
}

/// State of one `execute` call.
struct Run<'a> {
    executor: &'a WorkflowExecutor,
    workflow: &'a WorkflowDefinition,
    emitter: Emitter,
    escalations: Mutex<Vec<Escalation>>,
}

impl<'a> Run<'a> {
    fn run_steps<'s>(
        &'s self,
        steps: &'s [StepDefinition],
        parent: &'s str,
        ctx: &'s mut ExecutionContext,
        task: Option<TaskPosition>,
    ) -> BoxFuture<'s, Result<(), WorkflowError>> {
        Box::pin(async move {
            for step in steps {
                self.run_step(step, parent, ctx, task).await?;
            }
            Ok(())
        })
    }

    fn run_step<'s>(
        &'s self,
        step: &'s StepDefinition,
        parent: &'s str,
        ctx: &'s mut ExecutionContext,
        task: Option<TaskPosition>,
    ) -> BoxFuture<'s, Result<(), WorkflowError>> {
        Box::pin(async move {
            let path = child_path(parent, &step.name);

            let gate = entry_gate(step, &*ctx);
            match gate {
                Ok(Some(reason)) => {
                    tracing::info!("[Executor] ⏭ {} skipped ({})", path, reason);
                    self.emitter.skipped(&path, task, reason).await;
                    return Ok(());
                }
                Ok(None) => self.emitter.started(&path, task).await,
                Err(e) => {
                    self.emitter.started(&path, task).await;
                    self.emitter.failed(&path, task, &e.to_string()).await;
                    return Err(WorkflowError::Step { path, source: e });
                }
            }

            tracing::info!("[Executor] ▶ {} ({})", path, step.type_name());
            let result = match &step.kind {
                StepKind::AgentPrompt(ap) => self.agent_step(step, ap, &path, ctx).await,
                StepKind::Code(code) => self.code_step(step, code, &path, ctx).await,
                StepKind::Parallel(p) => self.parallel_step(step, p, &path, ctx, task).await,
                StepKind::Loop(l) => self.loop_step(step, l, &path, ctx, task).await,
                StepKind::PerTask(p) => self.per_task_step(step, p, &path, ctx).await,
            };

            match result {
                Ok(extra) => {
                    tracing::info!("[Executor] ✅ {} completed", path);
                    self.emitter.completed(&path, task, extra).await;
                    Ok(())
                }
                Err(Failure::Own(e)) => {
                    tracing::warn!("[Executor] ❌ {} failed: {}", path, e);
                    self.emitter.failed(&path, task, &e.to_string()).await;
                    Err(WorkflowError::Step { path, source: e })
                }
                Err(Failure::Nested { own, cause }) => {
                    tracing::warn!("[Executor] ❌ {} failed: {}", path, own);
                    self.emitter.failed(&path, task, &own.to_string()).await;
                    Err(cause)
                }
                Err(Failure::Rejected { own, result }) => {
                    tracing::warn!("[Executor] ❌ {} failed: {}", path, own);
                    self.emitter
                        .failed_with(&path, task, &own.to_string(), result_meta(result))
                        .await;
                    Err(WorkflowError::Step { path, source: own })
                }
            }
        })
    }

    /// Apply the per-step timeout, if one is configured.
    async fn limited<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StepError>>,
    ) -> Result<T, StepError> {
        match self.workflow.safety.step_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), fut)
                .await
                .map_err(|_| StepError::Timeout { secs })?,
            None => fut.await,
        }
    }

    fn bind_output(
        &self,
        step: &StepDefinition,
        path: &str,
        ctx: &mut ExecutionContext,
        value: &Value,
    ) -> Result<(), StepError> {
        if let Some(ref name) = step.output {
            ctx.bind(path, name, value.clone())?;
        }
        Ok(())
    }

    fn agent_name(&self, ap: &AgentPromptStep) -> Option<String> {
        ap.agent
            .clone()
            .or_else(|| self.workflow.defaults.agent.clone())
    }

    /// Resolve, render and run one agent prompt against `ctx`. Does not
    /// touch the context and does not apply `failWhen`.
    async fn invoke_agent(
        &self,
        ap: &AgentPromptStep,
        path: &str,
        ctx: &ExecutionContext,
        preloaded: Option<AgentDefinition>,
    ) -> Result<(Value, Map<String, Value>), StepError> {
        let locator = &self.executor.locator;
        let defaults = &self.workflow.defaults;

        let agent = match preloaded {
            Some(agent) => Some(agent),
            None => match self.agent_name(ap) {
                Some(name) => Some(locator.load_agent(&name)?),
                None => None,
            },
        };

        let (template_text, system_template) = match (&ap.prompt, &agent) {
            (Some(PromptSource::Inline(text)), agent) => {
                (text.clone(), agent.as_ref().map(|a| a.prompt.clone()))
            }
            (Some(PromptSource::File(name)), agent) => (
                locator.load_prompt(name)?.body,
                agent.as_ref().map(|a| a.prompt.clone()),
            ),
            (None, Some(agent)) => (agent.prompt.clone(), None),
            (None, None) => {
                return Err(StepError::Definition(format!(
                    "step '{}' has neither an agent nor a prompt",
                    path
                )))
            }
        };

        let request = {
            let input = match ap.input {
                Some(ref expr) => Some(eval(expr, ctx)?),
                None => None,
            };
            let scope = InputScope {
                context: ctx,
                input: input.as_ref(),
            };
            let output_schema = match agent.as_ref().and_then(|a| a.output_schema.as_deref()) {
                Some(name) => Some(locator.load_schema(name)?),
                None => None,
            };
            AgentRequest {
                prompt: template::render(&template_text, &scope),
                system_prompt: system_template
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| template::render(&s, &scope)),
                model: ap
                    .model
                    .clone()
                    .or_else(|| agent.as_ref().and_then(|a| a.model.clone()))
                    .or_else(|| defaults.model.clone()),
                permission_mode: defaults.permission_mode.clone(),
                setting_sources: defaults.setting_sources.clone(),
                allowed_tools: agent.as_ref().map(|a| a.tools.clone()).unwrap_or_default(),
                output_schema,
            }
        };

        tracing::debug!(
            "[Executor] {} → agent {} (model: {})",
            path,
            agent.as_ref().map(|a| a.name.as_str()).unwrap_or("<inline>"),
            request.model.as_deref().unwrap_or("<default>")
        );

        let run = collect_result(self.executor.agent.query(request)).await?;
        let output = run.result.payload();
        let meta = match run.metadata() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok((output, meta))
    }

    fn check_fail_when(
        &self,
        ap: &AgentPromptStep,
        ctx: &ExecutionContext,
        output: &Value,
    ) -> Result<(), StepError> {
        if let Some(ref expr) = ap.fail_when {
            if truthy(expr, &ctx.with_output(output))? {
                return Err(StepError::FailWhen {
                    expression: expr.clone(),
                });
            }
        }
        Ok(())
    }

    async fn agent_step(
        &self,
        step: &StepDefinition,
        ap: &AgentPromptStep,
        path: &str,
        ctx: &mut ExecutionContext,
    ) -> StepResult {
        let (output, mut meta) = self.limited(self.invoke_agent(ap, path, ctx, None)).await?;
        // Bound before failWhen so a rejected output stays inspectable.
        self.bind_output(step, path, ctx, &output)?;
        if let Err(own) = self.check_fail_when(ap, ctx, &output) {
            return Err(Failure::Rejected { own, result: output });
        }
        meta.insert("result".into(), output);
        Ok(meta)
    }

    async fn code_step(
        &self,
        step: &StepDefinition,
        code: &CodeStep,
        path: &str,
        ctx: &mut ExecutionContext,
    ) -> StepResult {
        let input = match code.input {
            Some(ref expr) => eval(expr, &*ctx)?,
            None => ctx.snapshot(),
        };
        let handler = self
            .executor
            .handlers
            .get(&code.handler)
            .ok_or_else(|| StepError::UnknownHandler(code.handler.clone()))?;

        let name = code.handler.clone();
        let output = self
            .limited(async move {
                tokio::task::spawn_blocking(move || handler(input))
                    .await
                    .map_err(|e| StepError::Handler {
                        handler: name.clone(),
                        message: e.to_string(),
                    })?
                    .map_err(|message| StepError::Handler {
                        handler: name,
                        message,
                    })
            })
            .await?;

        self.bind_output(step, path, ctx, &output)?;
        let mut meta = Map::new();
        meta.insert("handler".into(), Value::String(code.handler.clone()));
        meta.insert("result".into(), output);
        Ok(meta)
    }

    fn plan_child(
        &self,
        child: &StepDefinition,
        ap: &AgentPromptStep,
        gate_group: bool,
        snapshot: &ExecutionContext,
        changed: Option<&[String]>,
    ) -> ChildPlan {
        match entry_gate(child, snapshot) {
            Ok(Some(reason)) => return ChildPlan::Skip(reason),
            Ok(None) => {}
            Err(e) => return ChildPlan::Fail(e),
        }
        if !gate_group {
            return ChildPlan::Run(None);
        }
        let Some(name) = self.agent_name(ap) else {
            return ChildPlan::Run(None);
        };
        match self.executor.locator.load_gate(&name) {
            Ok(gate) if !gate.should_run(changed) => ChildPlan::Skip("gate not applicable"),
            Ok(gate) => ChildPlan::Run(Some(gate.agent)),
            Err(e) => ChildPlan::Fail(e.into()),
        }
    }

    async fn parallel_step(
        &self,
        step: &StepDefinition,
        p: &ParallelStep,
        path: &str,
        ctx: &mut ExecutionContext,
        task: Option<TaskPosition>,
    ) -> StepResult {
        let snapshot = ctx.clone();
        let changed = changed_files(&snapshot);

        let children = p.steps.iter().filter_map(|child| match &child.kind {
            StepKind::AgentPrompt(ap) => Some((child, ap)),
            _ => None,
        });

        let runs = children.map(|(child, ap)| {
            let snapshot = &snapshot;
            let plan = self.plan_child(child, ap, p.gate_group, snapshot, changed.as_deref());
            async move {
                let cpath = child_path(path, &child.name);
                let preloaded = match plan {
                    ChildPlan::Skip(reason) => {
                        tracing::info!("[Executor] ⏭ {} skipped ({})", cpath, reason);
                        self.emitter.skipped(&cpath, task, reason).await;
                        return None;
                    }
                    ChildPlan::Fail(e) => {
                        self.emitter.started(&cpath, task).await;
                        self.emitter.failed(&cpath, task, &e.to_string()).await;
                        return Some((child, cpath, Err(e)));
                    }
                    ChildPlan::Run(preloaded) => preloaded,
                };

                self.emitter.started(&cpath, task).await;
                let invoked = self
                    .limited(self.invoke_agent(ap, &cpath, snapshot, preloaded))
                    .await;
                let result = match invoked {
                    Ok((output, mut meta)) => match self.check_fail_when(ap, snapshot, &output) {
                        Ok(()) => {
                            meta.insert("result".into(), output.clone());
                            self.emitter.completed(&cpath, task, meta).await;
                            Ok(output)
                        }
                        Err(e) => {
                            tracing::warn!("[Executor] ❌ {} failed: {}", cpath, e);
                            self.emitter
                                .failed_with(&cpath, task, &e.to_string(), result_meta(output))
                                .await;
                            Err(e)
                        }
                    },
                    Err(e) => {
                        tracing::warn!("[Executor] ❌ {} failed: {}", cpath, e);
                        self.emitter.failed(&cpath, task, &e.to_string()).await;
                        Err(e)
                    }
                };
                Some((child, cpath, result))
            }
        });

        let settled: Vec<_> = join_all(runs).await.into_iter().flatten().collect();

        let failures: Vec<String> = settled
            .iter()
            .filter_map(|(child, _, r)| r.as_ref().err().map(|e| format!("{}: {}", child.name, e)))
            .collect();
        if !failures.is_empty() {
            return Err(StepError::ChildrenFailed {
                total: settled.len(),
                failures,
            }
            .into());
        }

        let mut named = Vec::with_capacity(settled.len());
        for (child, cpath, result) in settled {
            let Ok(output) = result else {
                continue;
            };
            self.bind_output(child, &cpath, ctx, &output)?;
            let review = ReviewResult::from_value(&output).map_err(|message| StepError::InvalidReview {
                step: child.name.clone(),
                message,
            })?;
            named.push((child.name.clone(), review));
        }

        let aggregated = aggregate(&named, p.min_severity);
        let value = serde_json::to_value(&aggregated).unwrap_or_default();
        self.bind_output(step, path, ctx, &value)?;

        let mut meta = Map::new();
        meta.insert("reviewers".into(), Value::from(named.len()));
        meta.insert("verdict".into(), value["verdict"].clone());
        meta.insert("issues".into(), Value::from(aggregated.issues.len()));
        meta.insert(
            "hasActionableIssues".into(),
            Value::Bool(aggregated.has_actionable_issues),
        );
        meta.insert("result".into(), value);
        Ok(meta)
    }

    async fn loop_step(
        &self,
        step: &StepDefinition,
        l: &LoopStep,
        path: &str,
        ctx: &mut ExecutionContext,
        task: Option<TaskPosition>,
    ) -> StepResult {
        let max = match self.workflow.safety.max_loop_retries {
            Some(ceiling) if ceiling < l.max_retries => {
                tracing::debug!(
                    "[Executor] {} maxRetries {} clamped to {}",
                    path,
                    l.max_retries,
                    ceiling
                );
                ceiling
            }
            _ => l.max_retries,
        };

        let mut iterations: u32 = 0;
        let mut last_error: Option<String> = None;
        loop {
            let holds = truthy(&l.condition, &*ctx)? || last_error.is_some();
            if !holds {
                break;
            }
            if iterations >= max {
                return self.exhausted(step, l, path, ctx, iterations, last_error);
            }
            iterations += 1;
            tracing::info!("[Executor] ↻ {} iteration {}/{}", path, iterations, max);
            match self.run_steps(&l.steps, path, ctx, task).await {
                Ok(()) => last_error = None,
                Err(e) => {
                    tracing::warn!("[Executor] {} iteration {} failed: {}", path, iterations, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        let mut meta = Map::new();
        meta.insert("iterations".into(), Value::from(iterations));
        self.bind_output(step, path, ctx, &Value::Object(meta.clone()))?;
        Ok(meta)
    }

    fn exhausted(
        &self,
        step: &StepDefinition,
        l: &LoopStep,
        path: &str,
        ctx: &mut ExecutionContext,
        iterations: u32,
        last_error: Option<String>,
    ) -> StepResult {
        let mut meta = Map::new();
        meta.insert("iterations".into(), Value::from(iterations));
        meta.insert("exhausted".into(), Value::Bool(true));

        match l.on_exhausted {
            ExhaustionPolicy::Fail => {
                return Err(StepError::LoopExhausted {
                    iterations,
                    condition: l.condition.clone(),
                    last_error,
                }
                .into())
            }
            ExhaustionPolicy::Warn => {
                tracing::warn!(
                    "[Executor] {} exhausted after {} iterations, condition '{}' still holds",
                    path,
                    iterations,
                    l.condition
                );
            }
            ExhaustionPolicy::Escalate => {
                tracing::warn!(
                    "[Executor] {} escalated after {} iterations, condition '{}' still holds",
                    path,
                    iterations,
                    l.condition
                );
                meta.insert("escalated".into(), Value::Bool(true));
                lock(&self.escalations).push(Escalation {
                    path: path.to_string(),
                    condition: l.condition.clone(),
                    iterations,
                });
            }
        }
        if let Some(error) = last_error {
            meta.insert("lastError".into(), Value::String(error));
        }
        self.bind_output(step, path, ctx, &Value::Object(meta.clone()))?;
        Ok(meta)
    }

    async fn per_task_step(
        &self,
        step: &StepDefinition,
        p: &PerTaskStep,
        path: &str,
        ctx: &mut ExecutionContext,
    ) -> StepResult {
        let tasks = match eval(&p.source, &*ctx)? {
            Value::Array(tasks) => tasks,
            other => {
                return Err(StepError::InvalidSource {
                    expression: p.source.clone(),
                    found: type_of(&other).to_string(),
                }
                .into())
            }
        };

        let count = tasks.len();
        let mut results = Vec::with_capacity(count);
        for (index, item) in tasks.into_iter().enumerate() {
            let mut overlay = Map::new();
            overlay.insert("task".into(), item);
            overlay.insert("taskIndex".into(), Value::from(index));
            overlay.insert("taskCount".into(), Value::from(count));
            ctx.push_scope(overlay);

            let position = Some(TaskPosition { index, count });
            let outcome = self.run_steps(&p.steps, path, ctx, position).await;
            let mut bindings = ctx.pop_scope().unwrap_or_default();

            if let Err(cause) = outcome {
                return Err(Failure::Nested {
                    own: StepError::TaskFailed {
                        index: index + 1,
                        count,
                        message: cause.to_string(),
                    },
                    cause,
                });
            }
            for key in ["task", "taskIndex", "taskCount"] {
                bindings.remove(key);
            }
            results.push(Value::Object(bindings));
        }

        let output = Value::Array(results);
        self.bind_output(step, path, ctx, &output)?;
        let mut meta = Map::new();
        meta.insert("tasks".into(), Value::from(count));
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::agent::{AgentMessage, MessageStream, ResultMessage};
    use futures::StreamExt;
    use serde_json::json;

    /// Replies with a fixed payload per prompt prefix and records requests.
    struct ScriptedAgent {
        replies: Vec<(&'static str, Value)>,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedAgent {
        fn new(replies: Vec<(&'static str, Value)>) -> Arc<Self> {
            Arc::new(Self {
                replies,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<AgentRequest> {
            lock(&self.requests).clone()
        }
    }

    impl AgentQuery for ScriptedAgent {
        fn query(&self, request: AgentRequest) -> MessageStream {
            let reply = self
                .replies
                .iter()
                .find(|(prefix, _)| request.prompt.starts_with(prefix))
                .map(|(_, v)| v.clone());
            lock(&self.requests).push(request);
            let message = match reply {
                Some(value) => ResultMessage::structured(value),
                None => ResultMessage::error("error_during_execution", vec!["no script".into()]),
            };
            futures::stream::iter(vec![Ok(AgentMessage::Result(message))]).boxed()
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn statuses(outcome: &WorkflowOutcome) -> Vec<(String, AuditStatus)> {
        outcome
            .audit
            .iter()
            .map(|e| (e.path.clone(), e.status))
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_steps_bind_outputs() {
        let agent = ScriptedAgent::new(vec![("Plan", json!({ "tasks": [{ "id": "T1", "title": "x" }] }))]);
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: seq
version: 1
phases:
  - name: plan
    prompt: "Plan {{specPath}}"
    output: plan
  - name: order
    type: code
    handler: tasks.order
    input: plan.tasks
    output: ordered
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(agent.clone())
            .execute(&wf, params(json!({ "specPath": "docs/spec.md" })))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(agent.requests()[0].prompt, "Plan docs/spec.md");
        assert_eq!(outcome.context["ordered"][0]["id"], "T1");
        assert_eq!(
            statuses(&outcome),
            vec![
                ("plan".to_string(), AuditStatus::Started),
                ("plan".to_string(), AuditStatus::Completed),
                ("order".to_string(), AuditStatus::Started),
                ("order".to_string(), AuditStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_and_conditional_steps_are_skipped() {
        let agent = ScriptedAgent::new(vec![]);
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: skip
version: 1
phases:
  - { name: dormant, prompt: "x", enabled: false }
  - { name: gated, prompt: "y", condition: "mode == 'full'" }
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(agent.clone())
            .execute(&wf, params(json!({ "mode": "quick" })))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.summary.skipped, 2);
        assert!(agent.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_workflow() {
        let wf = WorkflowDefinition::from_yaml(
            "name: h\nversion: 1\nphases:\n  - { name: c, type: code, handler: nope }\n  - { name: after, prompt: x }\n",
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(ScriptedAgent::new(vec![]))
            .execute(&wf, Map::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_step(), Some("c"));
        assert!(outcome.entries_for("after").next().is_none());
    }

    #[tokio::test]
    async fn test_fail_when_keeps_rejected_output() {
        let agent = ScriptedAgent::new(vec![(
            "Plan",
            json!({ "tasks": [], "notes": "spec has no acceptance criteria" }),
        )]);
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: reject
version: 1
phases:
  - name: plan
    prompt: "Plan it"
    output: plan
    failWhen: "tasks.length == 0"
  - { name: after, prompt: "Plan more" }
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(agent.clone())
            .execute(&wf, Map::new())
            .await;

        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(WorkflowError::Step { source: StepError::FailWhen { .. }, .. })
        ));
        assert_eq!(outcome.context["plan"]["notes"], "spec has no acceptance criteria");

        let failed = outcome
            .entries_for("plan")
            .find(|e| e.status == AuditStatus::Failed)
            .unwrap();
        let meta = failed.metadata.as_ref().unwrap();
        assert_eq!(meta["result"]["notes"], "spec has no acceptance criteria");
        assert!(meta["error"].as_str().unwrap().contains("tasks.length == 0"));
        assert_eq!(agent.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_child_fail_when_records_result() {
        let agent = ScriptedAgent::new(vec![
            ("Security", json!({ "verdict": "approved", "issues": [] })),
            ("Style", json!({ "verdict": "needs_revision", "issues": [] })),
        ]);
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: reviews
version: 1
phases:
  - name: review
    type: parallel
    output: review
    steps:
      - { name: security, prompt: "Security review" }
      - name: style
        prompt: "Style review"
        failWhen: "verdict == 'needs_revision' && issues.length == 0"
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(agent).execute(&wf, Map::new()).await;

        assert_eq!(outcome.failed_step(), Some("review"));
        let failed = outcome
            .entries_for("review/style")
            .find(|e| e.status == AuditStatus::Failed)
            .unwrap();
        assert_eq!(failed.metadata.as_ref().unwrap()["result"]["verdict"], "needs_revision");
        assert!(outcome
            .entries_for("review/security")
            .any(|e| e.status == AuditStatus::Completed));
    }

    #[tokio::test]
    async fn test_binding_conflict_is_a_failure() {
        let mut handlers = HandlerRegistry::with_builtins();
        handlers.register("const", |_| Ok(json!(1)));
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: conflict
version: 1
phases:
  - { name: a, type: code, handler: const, output: value }
  - { name: b, type: code, handler: const, output: value }
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(ScriptedAgent::new(vec![]))
            .with_handlers(handlers)
            .execute(&wf, Map::new())
            .await;
        assert_eq!(outcome.failed_step(), Some("b"));
        assert!(matches!(
            outcome.error,
            Some(WorkflowError::Step { source: StepError::BindingConflict { .. }, .. })
        ));
    }

    #[tokio::test]
    async fn test_per_task_collects_iteration_bindings() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("shout", |v| Ok(json!(v.as_str().unwrap_or("").to_uppercase())));
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: tasks
version: 1
phases:
  - name: each
    type: per-task
    source: items
    output: done
    steps:
      - { name: up, type: code, handler: shout, input: task, output: loud }
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(ScriptedAgent::new(vec![]))
            .with_handlers(handlers)
            .execute(&wf, params(json!({ "items": ["a", "b"] })))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.context["done"], json!([{ "loud": "A" }, { "loud": "B" }]));

        let inner: Vec<_> = outcome.entries_for("each/up").collect();
        assert_eq!(inner.len(), 4);
        assert_eq!(inner[2].task_index(), Some(1));
        assert_eq!(inner[2].task_count(), Some(2));
    }

    #[tokio::test]
    async fn test_per_task_rejects_non_list_source() {
        let wf = WorkflowDefinition::from_yaml(
            "name: t\nversion: 1\nphases:\n  - name: each\n    type: per-task\n    source: items\n    steps:\n      - { name: x, prompt: y }\n",
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(ScriptedAgent::new(vec![]))
            .execute(&wf, params(json!({ "items": "nope" })))
            .await;
        assert!(matches!(
            outcome.error,
            Some(WorkflowError::Step { source: StepError::InvalidSource { ref found, .. }, .. }) if found == "string"
        ));
    }

    #[tokio::test]
    async fn test_loop_escalates_and_records_outcome() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("noop", |_| Ok(Value::Null));
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: esc
version: 1
safety:
  maxLoopRetries: 2
phases:
  - name: cycle
    type: loop
    condition: "true"
    maxRetries: 5
    steps:
      - { name: work, type: code, handler: noop }
"#,
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(ScriptedAgent::new(vec![]))
            .with_handlers(handlers)
            .execute(&wf, Map::new())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.entries_for("cycle/work").count(), 4);
        assert_eq!(outcome.escalations.len(), 1);
        assert_eq!(outcome.escalations[0].iterations, 2);
        let done = outcome.entries_for("cycle").last().unwrap();
        assert!(done.escalated());
    }

    #[tokio::test]
    async fn test_loop_with_false_condition_runs_nothing() {
        let wf = WorkflowDefinition::from_yaml(
            "name: l\nversion: 1\nphases:\n  - name: cycle\n    type: loop\n    condition: \"false\"\n    steps:\n      - { name: x, prompt: y }\n",
        )
        .unwrap();
        let outcome = WorkflowExecutor::new(ScriptedAgent::new(vec![]))
            .execute(&wf, Map::new())
            .await;
        assert!(outcome.success);
        let done = outcome.entries_for("cycle").last().unwrap();
        assert_eq!(done.status, AuditStatus::Completed);
        assert_eq!(done.metadata.as_ref().unwrap()["iterations"], 0);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        struct Slow;
        impl AgentQuery for Slow {
            fn query(&self, _request: AgentRequest) -> MessageStream {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    yield Ok(AgentMessage::Result(ResultMessage::success("late")));
                })
            }
        }
        let wf = WorkflowDefinition::from_yaml(
            "name: t\nversion: 1\nsafety:\n  stepTimeoutSecs: 1\nphases:\n  - { name: slow, prompt: x }\n",
        )
        .unwrap();
        tokio::time::pause();
        let outcome = WorkflowExecutor::new(Arc::new(Slow)).execute(&wf, Map::new()).await;
        assert!(matches!(
            outcome.error,
            Some(WorkflowError::Step { source: StepError::Timeout { secs: 1 }, .. })
        ));
    }

    #[tokio::test]
    async fn test_workflow_timeout_fails_open_steps() {
        struct Slow;
        impl AgentQuery for Slow {
            fn query(&self, _request: AgentRequest) -> MessageStream {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    yield Ok(AgentMessage::Result(ResultMessage::success("late")));
                })
            }
        }
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: t
version: 1
safety:
  workflowTimeoutSecs: 5
phases:
  - name: each
    type: per-task
    source: items
    steps:
      - { name: slow, prompt: x }
"#,
        )
        .unwrap();
        tokio::time::pause();
        let outcome = WorkflowExecutor::new(Arc::new(Slow))
            .execute(&wf, params(json!({ "items": [1] })))
            .await;
        assert!(matches!(outcome.error, Some(WorkflowError::Timeout { secs: 5 })));
        assert_eq!(
            statuses(&outcome),
            vec![
                ("each".to_string(), AuditStatus::Started),
                ("each/slow".to_string(), AuditStatus::Started),
                ("each/slow".to_string(), AuditStatus::Failed),
                ("each".to_string(), AuditStatus::Failed),
            ]
        );
        assert_eq!(outcome.audit[2].task_index(), Some(0));
    }
}
