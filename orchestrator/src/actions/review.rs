//! Pull request reviews: code review and security review.
//!
//! The pull request is located from the issue text, its head branch is
//! cloned, and the agent's review is posted on the pull request itself. The
//! tracker only gets a pointer to it.

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use super::{ActionHandler, issue_context};
use crate::core::labels::{LABEL_CODE_REVIEW, LABEL_SECURITY_REVIEW};
use crate::core::pr_ref::find_pr_in_texts;
use crate::core::types::Issue;
use crate::io::agent::AgentExecutor;
use crate::io::comments;
use crate::io::repo::RepoHost;
use crate::io::tracker::Tracker;

const MISSING_PR_MESSAGE: &str = "Could not find PR number in issue description or comments. Please include the PR URL or number.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewKind {
    Code,
    Security,
}

pub struct ReviewAction {
    kind: ReviewKind,
}

impl ReviewAction {
    pub fn code_review() -> Self {
        Self {
            kind: ReviewKind::Code,
        }
    }

    pub fn security_review() -> Self {
        Self {
            kind: ReviewKind::Security,
        }
    }

    fn header(&self) -> &'static str {
        match self.kind {
            ReviewKind::Code => "CODE REVIEW",
            ReviewKind::Security => "SECURITY REVIEW",
        }
    }

    fn noun(&self) -> &'static str {
        match self.kind {
            ReviewKind::Code => "Code review",
            ReviewKind::Security => "Security review",
        }
    }
}

impl ActionHandler for ReviewAction {
    fn label(&self) -> &str {
        match self.kind {
            ReviewKind::Code => LABEL_CODE_REVIEW,
            ReviewKind::Security => LABEL_SECURITY_REVIEW,
        }
    }

    fn action(&self) -> &str {
        match self.kind {
            ReviewKind::Code => "code_review",
            ReviewKind::Security => "security_review",
        }
    }

    fn execute(
        &self,
        issue: &Issue,
        tracker: &dyn Tracker,
        repo: &dyn RepoHost,
        agent: &AgentExecutor,
    ) -> Result<String> {
        let header = self.header();
        let comments_newest_first = tracker.comments(&issue.key)?;
        let Some(number) = find_pr_in_texts(
            &issue.description,
            comments_newest_first.iter().map(|c| c.body.as_str()),
        ) else {
            tracker.add_comment(
                &issue.key,
                &comments::section(&format!("{header} FAILED"), MISSING_PR_MESSAGE, None)?,
            )?;
            return Ok(format!("No PR found for {}", issue.key));
        };

        let pr = repo.pr_info(number)?;
        let checkout = repo.clone_repo(&pr.head_branch)?;

        let changed_files = pr
            .changed_files
            .iter()
            .map(|file| format!("- {file}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut context = issue_context(issue);
        context.insert("pr_number".to_string(), Value::from(number));
        context.insert("pr_title".to_string(), Value::from(pr.title.as_str()));
        context.insert("pr_description".to_string(), Value::from(pr.body.as_str()));
        context.insert("head_branch".to_string(), Value::from(pr.head_branch.as_str()));
        context.insert("base_branch".to_string(), Value::from(pr.base_branch.as_str()));
        context.insert("changed_files".to_string(), Value::from(changed_files));

        let result = agent.execute_with_template(checkout.path(), self.action(), &context)?;
        repo.add_pr_comment(number, &comments::section(header, &result.content, None)?)?;
        tracker.add_comment(
            &issue.key,
            &comments::section(
                &format!("{header} COMPLETE"),
                &format!("Review posted to PR #{number}"),
                Some(result.cost_usd),
            )?,
        )?;
        info!(issue = %issue.key, pr = number, action = self.action(), "review posted");
        Ok(format!("{} complete for PR #{number}", self.noun()))
    }
}
