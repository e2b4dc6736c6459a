//! Progress-comment reporter: keeps one issue/PR comment up to date with
//! the run's step table.
//!
//! The comment is created at initialization and edited in place afterwards.
//! With a non-zero debounce, entries only mark the snapshot dirty and
//! (re)arm a single timer; the final render on completion or error cancels
//! the timer and pushes immediately. A 401 or 404 from the surface disables
//! the reporter for the rest of the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{Reporter, ReporterError, RunInfo};
use crate::workflow::audit::{AuditStatus, ExecutionSummary, WorkflowAuditEntry};
use crate::workflow::schema::Visibility;

const MARKER: &str = "<!-- specflow:progress -->";
const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
const DEFAULT_DEBOUNCE_MS: u64 = 2000;

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl SurfaceError {
    /// Errors that will not go away by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SurfaceError::Unauthorized(_) | SurfaceError::NotFound(_))
    }
}

/// Somewhere a single progress comment can be created and edited.
#[async_trait]
pub trait CommentSurface: Send + Sync {
    /// Create the comment and return its id.
    async fn create_comment(&self, body: &str) -> Result<u64, SurfaceError>;

    async fn update_comment(&self, id: u64, body: &str) -> Result<(), SurfaceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrCommentConfig {
    pub owner: String,
    pub repo: String,
    pub issue_number: u64,
    pub token: String,
    pub debounce_ms: u64,
    pub api_base_url: String,
}

fn config_string(config: &Map<String, Value>, key: &str) -> Result<String, ReporterError> {
    match config.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ReporterError::Config(format!("'{}' is required", key))),
    }
}

fn config_u64(config: &Map<String, Value>, key: &str) -> Result<Option<u64>, ReporterError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ReporterError::Config(format!("'{}' must be a non-negative integer", key))),
        Some(other) => Err(ReporterError::Config(format!(
            "'{}' must be a non-negative integer, found {}",
            key, other
        ))),
    }
}

impl PrCommentConfig {
    /// Read a resolved reporter config: `owner`, `repo`, `issueNumber`,
    /// `token`, optional `debounceMs` and `apiBaseUrl`.
    pub fn from_map(config: &Map<String, Value>) -> Result<Self, ReporterError> {
        Ok(Self {
            owner: config_string(config, "owner")?,
            repo: config_string(config, "repo")?,
            issue_number: config_u64(config, "issueNumber")?
                .ok_or_else(|| ReporterError::Config("'issueNumber' is required".to_string()))?,
            token: config_string(config, "token")?,
            debounce_ms: config_u64(config, "debounceMs")?.unwrap_or(DEFAULT_DEBOUNCE_MS),
            api_base_url: match config.get("apiBaseUrl") {
                Some(Value::String(s)) if !s.is_empty() => s.trim_end_matches('/').to_string(),
                _ => DEFAULT_API_BASE_URL.to_string(),
            },
        })
    }
}

/// Replace every occurrence of the token before a message is logged.
pub fn redact(message: &str, token: &str) -> String {
    if token.is_empty() {
        message.to_string()
    } else {
        message.replace(token, "***")
    }
}

/// GitHub issue comments over the REST API.
pub struct GitHubCommentSurface {
    client: reqwest::Client,
    api_base_url: String,
    owner: String,
    repo: String,
    issue_number: u64,
    token: String,
}

impl GitHubCommentSurface {
    pub fn new(config: &PrCommentConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("specflow")
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_base_url: config.api_base_url.clone(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            issue_number: config.issue_number,
            token: config.token.clone(),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, SurfaceError> {
        let response = request
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| SurfaceError::Transport(redact(&e.to_string(), &self.token)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SurfaceError::Transport(redact(&e.to_string(), &self.token)))?;
        let text = redact(&text, &self.token);

        match status.as_u16() {
            200..=299 => Ok(serde_json::from_str(&text).unwrap_or(Value::Null)),
            401 => Err(SurfaceError::Unauthorized(text)),
            404 => Err(SurfaceError::NotFound(text)),
            code => Err(SurfaceError::Status {
                status: code,
                message: text,
            }),
        }
    }
}

#[async_trait]
impl CommentSurface for GitHubCommentSurface {
    async fn create_comment(&self, body: &str) -> Result<u64, SurfaceError> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_base_url, self.owner, self.repo, self.issue_number
        );
        let json = self
            .send(self.client.post(&url).json(&serde_json::json!({ "body": body })))
            .await?;
        json.get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| SurfaceError::Transport("comment response has no id".to_string()))
    }

    async fn update_comment(&self, id: u64, body: &str) -> Result<(), SurfaceError> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments/{}",
            self.api_base_url, self.owner, self.repo, id
        );
        self.send(self.client.patch(&url).json(&serde_json::json!({ "body": body })))
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone)]
struct StepSnapshot {
    path: String,
    visibility: Visibility,
    status: AuditStatus,
    started_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    task_index: Option<u64>,
    task_count: Option<u64>,
}

#[derive(Default)]
struct State {
    workflow: String,
    comment_id: Option<u64>,
    steps: Vec<StepSnapshot>,
    dirty: bool,
    disabled: bool,
    timer: Option<JoinHandle<()>>,
    error: Option<String>,
    finished: Option<(ExecutionSummary, bool)>,
}

impl State {
    fn apply(&mut self, entry: &WorkflowAuditEntry, visibility: Visibility) {
        let index = match self.steps.iter().position(|s| s.path == entry.path) {
            Some(i) => i,
            None => {
                self.steps.push(StepSnapshot {
                    path: entry.path.clone(),
                    visibility,
                    status: entry.status,
                    started_at: None,
                    duration_ms: None,
                    task_index: None,
                    task_count: None,
                });
                self.steps.len() - 1
            }
        };
        let step = &mut self.steps[index];
        step.status = entry.status;
        if entry.task_count().is_some() {
            step.task_index = entry.task_index();
            step.task_count = entry.task_count();
        }
        match entry.status {
            AuditStatus::Started => {
                step.started_at = Some(entry.timestamp);
                step.duration_ms = None;
            }
            _ => {
                step.duration_ms = step
                    .started_at
                    .map(|start| (entry.timestamp - start).num_milliseconds());
            }
        }
    }
}

fn status_cell(step: &StepSnapshot) -> String {
    let label = match step.status {
        AuditStatus::Started => "⏳ running",
        AuditStatus::Completed => "✅ completed",
        AuditStatus::Failed => "❌ failed",
        AuditStatus::Skipped => "⏭ skipped",
    };
    match (step.task_index, step.task_count) {
        (Some(i), Some(n)) => format!("{} (task {}/{})", label, i + 1, n),
        _ => label.to_string(),
    }
}

fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

/// Markdown body for the current state. Summary-visibility steps are only
/// listed once the run has finished.
fn render(state: &State) -> String {
    let finished = state.finished.is_some();
    let headline = match &state.finished {
        None => "running",
        Some((_, true)) => "completed",
        Some((_, false)) => "failed",
    };

    let mut body = format!("{}\n### Workflow `{}` ({})\n\n", MARKER, state.workflow, headline);

    if let Some(ref error) = state.error {
        body.push_str(&format!("> ⚠️ **Workflow error:** {}\n\n", error));
    }

    body.push_str("| Step | Status | Duration |\n|---|---|---|\n");
    for step in &state.steps {
        if step.visibility == Visibility::Summary && !finished {
            continue;
        }
        body.push_str(&format!(
            "| `{}` | {} | {} |\n",
            step.path,
            status_cell(step),
            step.duration_ms.map(format_duration).unwrap_or_default()
        ));
    }

    if let Some((summary, _)) = &state.finished {
        body.push_str(&format!(
            "\n**{}** completed · **{}** failed · **{}** skipped · **{}** escalated · total {}\n",
            summary.completed,
            summary.failed,
            summary.skipped,
            summary.escalated,
            format_duration(summary.total_duration_ms)
        ));
    }
    body
}

struct Inner {
    surface: Box<dyn CommentSurface>,
    token: String,
    debounce: Duration,
    state: Mutex<State>,
}

impl Inner {
    /// Push the current render if anything changed. Caller holds the lock.
    async fn flush(&self, state: &mut State) -> Result<(), ReporterError> {
        if state.disabled || !state.dirty {
            return Ok(());
        }
        let Some(id) = state.comment_id else {
            return Ok(());
        };
        let body = render(state);
        match self.surface.update_comment(id, &body).await {
            Ok(()) => {
                state.dirty = false;
                Ok(())
            }
            Err(e) => {
                let message = redact(&e.to_string(), &self.token);
                if e.is_fatal() {
                    state.disabled = true;
                    tracing::warn!("[PrComment] Disabling progress comment: {}", message);
                }
                Err(ReporterError::Surface(message))
            }
        }
    }

    async fn flush_pending(&self) {
        let mut state = self.state.lock().await;
        state.timer = None;
        if let Err(e) = self.flush(&mut state).await {
            tracing::warn!("[PrComment] Debounced update failed: {}", e);
        }
    }
}

pub struct PrCommentReporter {
    inner: Arc<Inner>,
}

impl PrCommentReporter {
    pub fn new(config: PrCommentConfig, surface: Box<dyn CommentSurface>) -> Self {
        Self {
            inner: Arc::new(Inner {
                surface,
                token: config.token,
                debounce: Duration::from_millis(config.debounce_ms),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Cancel any pending timer and push the final render.
    async fn finish(&self, update: impl FnOnce(&mut State)) -> Result<(), ReporterError> {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.disabled {
            return Ok(());
        }
        update(&mut state);
        state.dirty = true;
        self.inner.flush(&mut state).await
    }
}

#[async_trait]
impl Reporter for PrCommentReporter {
    fn name(&self) -> &str {
        "pr-comment"
    }

    async fn initialize(&self, run: &RunInfo) -> Result<(), ReporterError> {
        let mut state = self.inner.state.lock().await;
        state.workflow = run.workflow.clone();
        let body = render(&state);
        match self.inner.surface.create_comment(&body).await {
            Ok(id) => {
                tracing::info!("[PrComment] Created progress comment {}", id);
                state.comment_id = Some(id);
                Ok(())
            }
            Err(e) => {
                state.disabled = true;
                Err(ReporterError::Surface(redact(&e.to_string(), &self.inner.token)))
            }
        }
    }

    async fn on_entry(&self, entry: &WorkflowAuditEntry, visibility: Visibility) -> Result<(), ReporterError> {
        let mut state = self.inner.state.lock().await;
        if state.disabled {
            return Ok(());
        }
        state.apply(entry, visibility);
        state.dirty = true;

        if self.inner.debounce.is_zero() {
            return self.inner.flush(&mut state).await;
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let inner = self.inner.clone();
        let delay = self.inner.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_pending().await;
        }));
        Ok(())
    }

    async fn on_complete(&self, summary: &ExecutionSummary, success: bool) -> Result<(), ReporterError> {
        let summary = summary.clone();
        self.finish(move |state| state.finished = Some((summary, success)))
            .await
    }

    async fn on_error(&self, message: &str) -> Result<(), ReporterError> {
        let message = redact(message, &self.inner.token);
        self.finish(move |state| state.error = Some(message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(String),
        Update(u64, String),
    }

    #[derive(Clone, Default)]
    struct FakeSurface {
        calls: Arc<StdMutex<Vec<Call>>>,
        fail_updates_with: Arc<StdMutex<Option<u16>>>,
    }

    impl FakeSurface {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn updates(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Update(_, body) => Some(body),
                    Call::Create(_) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl CommentSurface for FakeSurface {
        async fn create_comment(&self, body: &str) -> Result<u64, SurfaceError> {
            self.calls.lock().unwrap().push(Call::Create(body.to_string()));
            Ok(7)
        }

        async fn update_comment(&self, id: u64, body: &str) -> Result<(), SurfaceError> {
            self.calls.lock().unwrap().push(Call::Update(id, body.to_string()));
            match *self.fail_updates_with.lock().unwrap() {
                Some(401) => Err(SurfaceError::Unauthorized("bad credentials".into())),
                Some(404) => Err(SurfaceError::NotFound("gone".into())),
                Some(code) => Err(SurfaceError::Status {
                    status: code,
                    message: "proxy echoed Authorization: Bearer ghp_secret".into(),
                }),
                None => Ok(()),
            }
        }
    }

    fn config(debounce_ms: u64) -> PrCommentConfig {
        PrCommentConfig {
            owner: "acme".into(),
            repo: "widgets".into(),
            issue_number: 12,
            token: "ghp_secret".into(),
            debounce_ms,
            api_base_url: DEFAULT_API_BASE_URL.into(),
        }
    }

    fn run() -> RunInfo {
        RunInfo {
            workflow: "implement-spec".into(),
            run_id: "r1".into(),
        }
    }

    fn entry(path: &str, status: AuditStatus) -> WorkflowAuditEntry {
        WorkflowAuditEntry::new(path, status, None)
    }

    #[tokio::test]
    async fn test_immediate_mode_pushes_every_entry() {
        let surface = FakeSurface::default();
        let reporter = PrCommentReporter::new(config(0), Box::new(surface.clone()));
        reporter.initialize(&run()).await.unwrap();
        reporter
            .on_entry(&entry("analyze", AuditStatus::Started), Visibility::Visible)
            .await
            .unwrap();
        reporter
            .on_entry(&entry("analyze", AuditStatus::Completed), Visibility::Visible)
            .await
            .unwrap();

        let calls = surface.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Create(ref body) if body.contains(MARKER)));
        let updates = surface.updates();
        assert!(updates[0].contains("running"));
        assert!(updates[1].contains("✅ completed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_updates() {
        let surface = FakeSurface::default();
        let reporter = PrCommentReporter::new(config(1000), Box::new(surface.clone()));
        reporter.initialize(&run()).await.unwrap();

        for status in [AuditStatus::Started, AuditStatus::Completed] {
            reporter
                .on_entry(&entry("analyze", status), Visibility::Visible)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        reporter
            .on_entry(&entry("implement", AuditStatus::Started), Visibility::Visible)
            .await
            .unwrap();
        assert!(surface.updates().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        let updates = surface.updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].contains("`implement`"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_timer_and_renders_summary() {
        let surface = FakeSurface::default();
        let reporter = PrCommentReporter::new(config(5000), Box::new(surface.clone()));
        reporter.initialize(&run()).await.unwrap();
        reporter
            .on_entry(&entry("analyze", AuditStatus::Started), Visibility::Visible)
            .await
            .unwrap();
        reporter
            .on_entry(&entry("review", AuditStatus::Completed), Visibility::Summary)
            .await
            .unwrap();

        let summary = ExecutionSummary {
            completed: 2,
            skipped: 1,
            ..Default::default()
        };
        reporter.on_complete(&summary, true).await.unwrap();
        let updates = surface.updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].contains("(completed)"));
        assert!(updates[0].contains("`review`"));
        assert!(updates[0].contains("**2** completed"));

        tokio::time::sleep(Duration::from_millis(6000)).await;
        tokio::task::yield_now().await;
        assert_eq!(surface.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_summary_rows_hidden_until_final() {
        let surface = FakeSurface::default();
        let reporter = PrCommentReporter::new(config(0), Box::new(surface.clone()));
        reporter.initialize(&run()).await.unwrap();
        reporter
            .on_entry(&entry("review", AuditStatus::Started), Visibility::Summary)
            .await
            .unwrap();
        assert!(!surface.updates()[0].contains("`review`"));
    }

    #[tokio::test]
    async fn test_unauthorized_disables_reporter() {
        let surface = FakeSurface::default();
        let reporter = PrCommentReporter::new(config(0), Box::new(surface.clone()));
        reporter.initialize(&run()).await.unwrap();
        *surface.fail_updates_with.lock().unwrap() = Some(401);

        assert!(reporter
            .on_entry(&entry("a", AuditStatus::Started), Visibility::Visible)
            .await
            .is_err());
        reporter
            .on_entry(&entry("a", AuditStatus::Completed), Visibility::Visible)
            .await
            .unwrap();
        reporter.on_error("boom").await.unwrap();
        assert_eq!(surface.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_keep_reporter_alive() {
        let surface = FakeSurface::default();
        let reporter = PrCommentReporter::new(config(0), Box::new(surface.clone()));
        reporter.initialize(&run()).await.unwrap();
        *surface.fail_updates_with.lock().unwrap() = Some(502);
        let err = reporter
            .on_entry(&entry("a", AuditStatus::Started), Visibility::Visible)
            .await
            .unwrap_err();
        assert!(matches!(err, ReporterError::Surface(_)));
        assert!(!err.to_string().contains("ghp_secret"), "{}", err);
        assert!(err.to_string().contains("Bearer ***"));
        *surface.fail_updates_with.lock().unwrap() = None;
        reporter.on_error("token ghp_secret leaked").await.unwrap();
        let updates = surface.updates();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].contains("Workflow error"));
        assert!(!updates[1].contains("ghp_secret"));
    }

    #[test]
    fn test_config_from_resolved_map() {
        let map = json!({
            "owner": "acme",
            "repo": "widgets",
            "issueNumber": 42,
            "token": "t",
            "apiBaseUrl": "https://ghe.example.com/api/v3/"
        });
        let config = PrCommentConfig::from_map(map.as_object().unwrap()).unwrap();
        assert_eq!(config.issue_number, 42);
        assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(config.api_base_url, "https://ghe.example.com/api/v3");

        let missing = json!({ "owner": "acme", "repo": "w", "token": "" , "issueNumber": 1 });
        assert!(PrCommentConfig::from_map(missing.as_object().unwrap()).is_err());
        let bad = json!({ "owner": "a", "repo": "w", "token": "t", "issueNumber": "abc" });
        assert!(PrCommentConfig::from_map(bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("Bearer abc123 failed", "abc123"), "Bearer *** failed");
        assert_eq!(redact("nothing", ""), "nothing");
    }
}
