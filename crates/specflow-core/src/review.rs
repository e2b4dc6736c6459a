//! Review results and the multi-reviewer aggregator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Important,
    Minor,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 3,
            Severity::Important => 2,
            Severity::Minor => 1,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "important" => Some(Severity::Important),
            "minor" => Some(Severity::Minor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Minor => "minor",
        }
    }
}

/// Threshold used when a step does not set `minSeverity`.
pub const DEFAULT_MIN_SEVERITY: Severity = Severity::Important;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    NeedsRevision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewIssue {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub fix_instructions: String,
    /// Reviewer the issue came from; filled in during aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// One reviewer's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResult {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub has_actionable_issues: bool,
    #[serde(default = "default_verdict")]
    pub verdict: Verdict,
}

fn default_verdict() -> Verdict {
    Verdict::Approved
}

impl ReviewResult {
    /// Parse a reviewer's structured output.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReviewResult {
    pub issues: Vec<ReviewIssue>,
    pub strengths: Vec<String>,
    pub has_actionable_issues: bool,
    pub verdict: Verdict,
    pub min_severity: Severity,
    /// Raw issue count per reviewer, before thresholding.
    pub issue_counts: BTreeMap<String, usize>,
}

/// Combine reviewer outputs into one verdict.
///
/// Issues are kept regardless of severity; only actionability depends on
/// the threshold. Reviewer-declared `hasActionableIssues` flags are ignored.
pub fn aggregate(named: &[(String, ReviewResult)], min_severity: Option<Severity>) -> AggregatedReviewResult {
    let min_severity = min_severity.unwrap_or(DEFAULT_MIN_SEVERITY);
    let mut issues = Vec::new();
    let mut strengths = Vec::new();
    let mut issue_counts = BTreeMap::new();

    for (source, result) in named {
        issue_counts.insert(source.clone(), result.issues.len());
        for issue in &result.issues {
            let mut issue = issue.clone();
            if issue.source.is_none() {
                issue.source = Some(source.clone());
            }
            issues.push(issue);
        }
        strengths.extend(result.strengths.iter().cloned());
    }

    let has_actionable_issues = issues
        .iter()
        .any(|issue| issue.severity.rank() >= min_severity.rank());

    AggregatedReviewResult {
        issues,
        strengths,
        has_actionable_issues,
        verdict: if has_actionable_issues {
            Verdict::NeedsRevision
        } else {
            Verdict::Approved
        },
        min_severity,
        issue_counts,
    }
}
