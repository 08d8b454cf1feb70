//! Read-only analysis actions: investigate, impact, recommend.
//!
//! Each clones the base branch, runs the agent under its own policy and posts
//! the agent's answer as a headed tracker comment.

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use super::{ActionHandler, check_issue_type, issue_context, prior_section};
use crate::core::labels::{LABEL_IMPACT, LABEL_INVESTIGATE, LABEL_RECOMMEND};
use crate::core::types::Issue;
use crate::io::agent::AgentExecutor;
use crate::io::comments;
use crate::io::repo::RepoHost;
use crate::io::tracker::Tracker;

pub const INVESTIGATION_HEADER: &str = "INVESTIGATION RESULTS";
pub const IMPACT_HEADER: &str = "IMPACT ANALYSIS";
pub const RECOMMENDATIONS_HEADER: &str = "RECOMMENDATIONS";

pub struct AnalysisAction {
    label: &'static str,
    action: &'static str,
    header: &'static str,
    done: &'static str,
    allowed_issue_types: &'static [&'static str],
    /// Feed the newest investigation into the prompt as `investigation_section`.
    uses_investigation: bool,
}

impl AnalysisAction {
    pub fn investigate() -> Self {
        Self {
            label: LABEL_INVESTIGATE,
            action: "investigate",
            header: INVESTIGATION_HEADER,
            done: "Investigation complete",
            allowed_issue_types: &[],
            uses_investigation: false,
        }
    }

    pub fn impact() -> Self {
        Self {
            label: LABEL_IMPACT,
            action: "impact",
            header: IMPACT_HEADER,
            done: "Impact analysis complete",
            allowed_issue_types: &["Bug", "Story"],
            uses_investigation: false,
        }
    }

    pub fn recommend() -> Self {
        Self {
            label: LABEL_RECOMMEND,
            action: "recommend",
            header: RECOMMENDATIONS_HEADER,
            done: "Recommendations posted",
            allowed_issue_types: &[],
            uses_investigation: true,
        }
    }
}

/// `## Prior Investigation` block, or empty when there is none.
pub(crate) fn investigation_section(tracker: &dyn Tracker, issue_key: &str) -> Result<String> {
    Ok(prior_section(tracker, issue_key, INVESTIGATION_HEADER)?
        .map(|body| {
            format!(
                "## Prior Investigation\n\nThe following investigation was already performed on this issue:\n\n{body}"
            )
        })
        .unwrap_or_default())
}

impl ActionHandler for AnalysisAction {
    fn label(&self) -> &str {
        self.label
    }

    fn action(&self) -> &str {
        self.action
    }

    fn allowed_issue_types(&self) -> &[&str] {
        self.allowed_issue_types
    }

    fn execute(
        &self,
        issue: &Issue,
        tracker: &dyn Tracker,
        repo: &dyn RepoHost,
        agent: &AgentExecutor,
    ) -> Result<String> {
        if !check_issue_type(self, issue, tracker)? {
            return Ok(format!("Rejected {}: invalid issue type", issue.key));
        }

        let mut context = issue_context(issue);
        if self.uses_investigation {
            let section = investigation_section(tracker, &issue.key)?;
            context.insert("investigation_section".to_string(), Value::from(section));
        }

        let checkout = repo.clone_repo(repo.base_branch())?;
        let result = agent.execute_with_template(checkout.path(), self.action, &context)?;
        tracker.add_comment(
            &issue.key,
            &comments::section(self.header, &result.content, Some(result.cost_usd))?,
        )?;
        info!(issue = %issue.key, action = self.action, cost_usd = result.cost_usd, "analysis posted");
        Ok(format!("{} for {}", self.done, issue.key))
    }
}
