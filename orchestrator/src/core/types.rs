//! Shared types exchanged between the daemon, the actions and the adapters.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tracker issue as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub key: String,
    /// Issue type name (e.g. `Bug`, `Story`, `Task`).
    pub issue_type: String,
    pub summary: String,
    /// Description text, empty when the tracker has none.
    pub description: String,
    pub labels: BTreeSet<String>,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

/// A tracker comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub body: String,
    /// Account id of the author.
    pub author_id: String,
    pub created: DateTime<Utc>,
}

/// Record of a tool call the agent was not allowed to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDenial {
    #[serde(alias = "tool_name", default = "unknown_tool")]
    pub tool: String,
    #[serde(default)]
    pub reason: String,
}

fn unknown_tool() -> String {
    "unknown".to_string()
}

/// Result of one agent invocation.
///
/// `content` is always populated: when the agent output is not the expected
/// JSON envelope it carries the raw stdout and every other field is zeroed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub content: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub session_id: String,
    pub permission_denials: Vec<PermissionDenial>,
}

impl AgentResult {
    /// Fallback for agent output that is not a JSON envelope.
    pub fn from_raw(raw: &str) -> Self {
        Self {
            content: raw.to_string(),
            cost_usd: 0.0,
            duration_ms: 0,
            session_id: String::new(),
            permission_denials: Vec::new(),
        }
    }
}

/// Pull request created by an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Fields needed to open a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Pull request metadata consumed by the review actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrInfo {
    pub head_branch: String,
    pub base_branch: String,
    pub changed_files: Vec<String>,
    pub title: String,
    pub body: String,
}
