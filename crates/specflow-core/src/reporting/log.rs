//! Progress lines through `tracing`.

use async_trait::async_trait;

use super::{Reporter, ReporterError, RunInfo};
use crate::workflow::audit::{AuditStatus, ExecutionSummary, WorkflowAuditEntry};
use crate::workflow::schema::Visibility;

#[derive(Debug, Default)]
pub struct LogReporter;

impl LogReporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Reporter for LogReporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn initialize(&self, run: &RunInfo) -> Result<(), ReporterError> {
        tracing::info!("[Progress] Workflow '{}' started (run {})", run.workflow, run.run_id);
        Ok(())
    }

    async fn on_entry(&self, entry: &WorkflowAuditEntry, visibility: Visibility) -> Result<(), ReporterError> {
        let task = match (entry.task_index(), entry.task_count()) {
            (Some(i), Some(n)) => format!(" [task {}/{}]", i + 1, n),
            _ => String::new(),
        };
        if visibility == Visibility::Summary {
            tracing::debug!("[Progress] {} {}{}", entry.path, entry.status.as_str(), task);
            return Ok(());
        }
        match entry.status {
            AuditStatus::Failed => tracing::warn!(
                "[Progress] {} failed{}: {}",
                entry.path,
                task,
                entry.error().unwrap_or("unknown error")
            ),
            status => tracing::info!("[Progress] {} {}{}", entry.path, status.as_str(), task),
        }
        Ok(())
    }

    async fn on_complete(&self, summary: &ExecutionSummary, success: bool) -> Result<(), ReporterError> {
        tracing::info!(
            "[Progress] Workflow {}: {} completed, {} failed, {} skipped, {} escalated in {}ms",
            if success { "completed" } else { "failed" },
            summary.completed,
            summary.failed,
            summary.skipped,
            summary.escalated,
            summary.total_duration_ms
        );
        Ok(())
    }

    async fn on_error(&self, message: &str) -> Result<(), ReporterError> {
        tracing::error!("[Progress] Workflow error: {}", message);
        Ok(())
    }
}
