//! Audit trail of a workflow run and the summary derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl AuditStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuditStatus::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAuditEntry {
    pub step: String,
    /// Slash-joined names from the root, e.g. `review-cycle/review/security`
    pub path: String,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WorkflowAuditEntry {
    pub fn new(path: &str, status: AuditStatus, metadata: Option<Value>) -> Self {
        Self {
            step: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            status,
            timestamp: Utc::now(),
            metadata,
        }
    }

    fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.as_ref()?.get(key)?.as_u64()
    }

    pub fn task_index(&self) -> Option<u64> {
        self.meta_u64("taskIndex")
    }

    pub fn task_count(&self) -> Option<u64> {
        self.meta_u64("taskCount")
    }

    pub fn error(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("error")?.as_str()
    }

    pub fn escalated(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("escalated"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub path: String,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub steps: Vec<StepSummary>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub escalated: usize,
    pub total_duration_ms: i64,
}

impl ExecutionSummary {
    /// Pair each terminal entry with its `started` entry (same path and task
    /// index). Steps are listed in the order they finished.
    pub fn from_entries(entries: &[WorkflowAuditEntry]) -> Self {
        let mut summary = ExecutionSummary::default();
        let mut open: Vec<&WorkflowAuditEntry> = Vec::new();

        for entry in entries {
            if entry.status == AuditStatus::Started {
                open.push(entry);
                continue;
            }
            let started = open
                .iter()
                .rposition(|s| s.path == entry.path && s.task_index() == entry.task_index())
                .map(|i| open.remove(i));

            match entry.status {
                AuditStatus::Completed => summary.completed += 1,
                AuditStatus::Failed => summary.failed += 1,
                AuditStatus::Skipped => summary.skipped += 1,
                AuditStatus::Started => {}
            }
            if entry.escalated() {
                summary.escalated += 1;
            }

            summary.steps.push(StepSummary {
                path: entry.path.clone(),
                status: entry.status,
                task_index: entry.task_index(),
                duration_ms: started
                    .map(|s| (entry.timestamp - s.timestamp).num_milliseconds()),
                error: entry.error().map(str::to_string),
            });
        }

        if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
            summary.total_duration_ms = (last.timestamp - first.timestamp).num_milliseconds();
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn at(path: &str, status: AuditStatus, ms: i64, meta: Option<Value>) -> WorkflowAuditEntry {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        WorkflowAuditEntry {
            timestamp: base + Duration::milliseconds(ms),
            ..WorkflowAuditEntry::new(path, status, meta)
        }
    }

    #[test]
    fn test_entry_name_is_last_path_segment() {
        let entry = WorkflowAuditEntry::new("cycle/review/security", AuditStatus::Started, None);
        assert_eq!(entry.step, "security");
        assert_eq!(entry.path, "cycle/review/security");
    }

    #[test]
    fn test_summary_pairs_entries() {
        let t0 = Some(json!({ "taskIndex": 0, "taskCount": 2 }));
        let t1 = Some(json!({ "taskIndex": 1, "taskCount": 2 }));
        let entries = vec![
            at("analyze", AuditStatus::Started, 0, None),
            at("analyze", AuditStatus::Completed, 100, None),
            at("implement", AuditStatus::Started, 100, None),
            at("implement/code", AuditStatus::Started, 110, t0.clone()),
            at("implement/code", AuditStatus::Completed, 150, t0),
            at("implement/code", AuditStatus::Started, 150, t1.clone()),
            at("implement/code", AuditStatus::Completed, 210, t1),
            at("implement", AuditStatus::Completed, 220, None),
            at("docs", AuditStatus::Skipped, 230, None),
            at("cycle", AuditStatus::Started, 230, None),
            at("cycle", AuditStatus::Completed, 300, Some(json!({ "escalated": true }))),
        ];
        let summary = ExecutionSummary::from_entries(&entries);
        assert_eq!(summary.completed, 5);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.total_duration_ms, 300);
        assert_eq!(summary.steps[0].duration_ms, Some(100));
        assert_eq!(summary.steps[1].task_index, Some(0));
        assert_eq!(summary.steps[2].duration_ms, Some(60));
        assert_eq!(summary.steps[4].duration_ms, None);
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let entry = WorkflowAuditEntry::new("a", AuditStatus::Failed, Some(json!({ "error": "boom" })));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["metadata"]["error"], "boom");
        assert_eq!(entry.error(), Some("boom"));
    }
}
