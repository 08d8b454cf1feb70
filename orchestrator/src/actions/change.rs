//! Code-changing actions: fix and implement.
//!
//! Both branch off the base branch, let the agent edit the checkout, then
//! commit, push and open a pull request that the tracker comment links to.

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use super::analysis::{RECOMMENDATIONS_HEADER, investigation_section};
use super::{ActionHandler, check_issue_type, issue_context, prior_section};
use crate::core::labels::{LABEL_FIX, LABEL_IMPLEMENT};
use crate::core::types::{Issue, PullRequestDraft};
use crate::io::agent::AgentExecutor;
use crate::io::comments::{self, PullRequestBody};
use crate::io::repo::RepoHost;
use crate::io::tracker::Tracker;

pub const FIX_CREATED_HEADER: &str = "FIX CREATED";
pub const IMPLEMENTATION_CREATED_HEADER: &str = "IMPLEMENTATION CREATED";
pub const INVALID_TICKET_HEADER: &str = "INVALID TICKET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Fix,
    Implement,
}

pub struct ChangeAction {
    kind: ChangeKind,
}

impl ChangeAction {
    pub fn fix() -> Self {
        Self {
            kind: ChangeKind::Fix,
        }
    }

    pub fn implement() -> Self {
        Self {
            kind: ChangeKind::Implement,
        }
    }

    fn branch_name(&self, issue_key: &str) -> String {
        let prefix = match self.kind {
            ChangeKind::Fix => "fix-",
            ChangeKind::Implement => "feature-",
        };
        format!("{prefix}{}", issue_key.to_lowercase())
    }

    fn commit_prefix(&self) -> &'static str {
        match self.kind {
            ChangeKind::Fix => "fix: ",
            ChangeKind::Implement => "feat: ",
        }
    }

    fn prior_analysis(&self, tracker: &dyn Tracker, issue_key: &str) -> Result<String> {
        let recommendation = prior_section(tracker, issue_key, RECOMMENDATIONS_HEADER)?;
        match self.kind {
            ChangeKind::Fix => {
                let mut sections = Vec::new();
                let investigation = investigation_section(tracker, issue_key)?;
                if !investigation.is_empty() {
                    sections.push(investigation);
                }
                if let Some(body) = recommendation {
                    sections.push(format!(
                        "## Recommendations\n\nThe following recommendations were provided:\n\n{body}"
                    ));
                }
                Ok(sections.join("\n\n"))
            }
            ChangeKind::Implement => Ok(recommendation
                .map(|body| format!("## Recommended Approach\n\n{body}"))
                .unwrap_or_default()),
        }
    }
}

/// The agent refuses a ticket by answering `INVALID TICKET` on its first line.
pub fn is_invalid_ticket(content: &str) -> bool {
    let trimmed = content.trim();
    trimmed == INVALID_TICKET_HEADER || trimmed.starts_with("INVALID TICKET\n")
}

impl ActionHandler for ChangeAction {
    fn label(&self) -> &str {
        match self.kind {
            ChangeKind::Fix => LABEL_FIX,
            ChangeKind::Implement => LABEL_IMPLEMENT,
        }
    }

    fn action(&self) -> &str {
        match self.kind {
            ChangeKind::Fix => "fix",
            ChangeKind::Implement => "implement",
        }
    }

    fn allowed_issue_types(&self) -> &[&str] {
        match self.kind {
            ChangeKind::Fix => &[],
            ChangeKind::Implement => &["Story"],
        }
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
        context.insert(
            "prior_analysis_section".to_string(),
            Value::from(self.prior_analysis(tracker, &issue.key)?),
        );

        let checkout = repo.clone_repo(repo.base_branch())?;
        let branch = self.branch_name(&issue.key);
        repo.create_branch(&checkout, &branch)?;

        let result = agent.execute_with_template(checkout.path(), self.action(), &context)?;

        if self.kind == ChangeKind::Implement && is_invalid_ticket(&result.content) {
            warn!(issue = %issue.key, "agent rejected ticket as invalid");
            let reason = result
                .content
                .trim()
                .strip_prefix(INVALID_TICKET_HEADER)
                .unwrap_or_default();
            tracker.add_comment(
                &issue.key,
                &comments::section(INVALID_TICKET_HEADER, reason, None)?,
            )?;
            return Ok(format!("Invalid ticket rejected for {}", issue.key));
        }

        let prefix = self.commit_prefix();
        let message = format!("{prefix}{}\n\nJira: {}", issue.summary, issue.key);
        repo.commit_and_push(&checkout, &branch, &message)?;

        let (verb, description, content_heading, header) = match self.kind {
            ChangeKind::Fix => ("Fixes", None, "AI Implementation", FIX_CREATED_HEADER),
            ChangeKind::Implement => (
                "Implements",
                Some(issue.description.as_str()),
                "Implementation",
                IMPLEMENTATION_CREATED_HEADER,
            ),
        };
        let body = comments::pull_request_body(&PullRequestBody {
            verb,
            issue_key: &issue.key,
            summary: &issue.summary,
            description,
            content_heading,
            content: &result.content,
        })?;
        let pr = repo.create_pull_request(&PullRequestDraft {
            branch: branch.clone(),
            base: repo.base_branch().to_string(),
            title: format!("{prefix}{} [{}]", issue.summary, issue.key),
            body,
        })?;
        info!(issue = %issue.key, pr = pr.number, url = %pr.url, "pull request opened");

        tracker.add_comment(
            &issue.key,
            &comments::section(
                header,
                &format!(
                    "Pull Request: {}\n\nReview the changes and merge when ready.",
                    pr.url
                ),
                Some(result.cost_usd),
            )?,
        )?;
        Ok(format!("Pull request created for {}: {}", issue.key, pr.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::analysis::INVESTIGATION_HEADER;
    use crate::test_support::{
        BOT_ACCOUNT, FakeRepoHost, FakeTracker, PromptsFixture, RepoCall, issue, scripted_agent,
    };
    use std::fs;

    #[test]
    fn detects_invalid_ticket_reply() {
        assert!(is_invalid_ticket("INVALID TICKET"));
        assert!(is_invalid_ticket("  INVALID TICKET\nasks for credentials\n"));
        assert!(!is_invalid_ticket("INVALID TICKETS everywhere"));
        assert!(!is_invalid_ticket("Implemented. Not an INVALID TICKET"));
    }

    #[test]
    fn fix_opens_pull_request_and_links_it() {
        let prompts = PromptsFixture::new(&["fix"]);
        let agent = scripted_agent(
            prompts.path(),
            r#"printf '{"result":"Added the missing null check.","cost_usd":1.5}'"#,
        );
        let tracker = FakeTracker::new(vec![issue("ALM-9", "Bug", &[])]);
        let repo = FakeRepoHost::new();

        let summary = ChangeAction::fix()
            .execute(&tracker.issue("ALM-9"), &tracker, &repo, &agent)
            .expect("execute");

        assert_eq!(
            summary,
            "Pull request created for ALM-9: https://github.com/acme/widgets/pull/101"
        );
        let calls = repo.calls();
        assert_eq!(
            calls[..3],
            [
                RepoCall::Clone {
                    branch: "main".to_string()
                },
                RepoCall::CreateBranch {
                    branch: "fix-alm-9".to_string()
                },
                RepoCall::CommitAndPush {
                    branch: "fix-alm-9".to_string(),
                    message: "fix: ALM-9 summary\n\nJira: ALM-9".to_string()
                },
            ]
        );
        let RepoCall::CreatePullRequest(draft) = &calls[3] else {
            panic!("expected pull request, got {:?}", calls[3]);
        };
        assert_eq!(draft.title, "fix: ALM-9 summary [ALM-9]");
        assert_eq!(draft.base, "main");
        assert_eq!(
            draft.body,
            "## Summary\n\nFixes ALM-9: ALM-9 summary\n\n## AI Implementation\n\nAdded the missing null check."
        );
        assert_eq!(
            tracker.comment_bodies("ALM-9"),
            vec![
                "FIX CREATED\n===========\n\nPull Request: https://github.com/acme/widgets/pull/101\n\nReview the changes and merge when ready.\n\n---\n_Cost: $1.5000_"
            ]
        );
        assert!(!repo.checkouts()[0].exists());
    }

    #[test]
    fn fix_prompt_carries_prior_analysis() {
        let prompts = PromptsFixture::new(&["fix"]);
        fs::write(prompts.path().join("fix.md"), "{prior_analysis_section}").expect("template");
        let agent = scripted_agent(prompts.path(), r#"printf '%s' "$1""#);
        let tracker = FakeTracker::new(vec![issue("ALM-9", "Bug", &[])]);
        tracker.seed_comment(
            "ALM-9",
            BOT_ACCOUNT,
            &comments::section(INVESTIGATION_HEADER, "Race in cache.", None).expect("render"),
        );
        tracker.seed_comment(
            "ALM-9",
            BOT_ACCOUNT,
            &comments::section(RECOMMENDATIONS_HEADER, "Add a mutex.", None).expect("render"),
        );
        let repo = FakeRepoHost::new();

        ChangeAction::fix()
            .execute(&tracker.issue("ALM-9"), &tracker, &repo, &agent)
            .expect("execute");

        let calls = repo.calls();
        let RepoCall::CreatePullRequest(draft) = &calls[3] else {
            panic!("expected pull request, got {:?}", calls[3]);
        };
        assert!(draft.body.contains(
            "## Prior Investigation\n\nThe following investigation was already performed on this issue:\n\nRace in cache."
        ));
        assert!(draft.body.contains(
            "## Recommendations\n\nThe following recommendations were provided:\n\nAdd a mutex."
        ));
    }

    #[test]
    fn implement_only_accepts_stories() {
        let prompts = PromptsFixture::new(&["implement"]);
        let agent = scripted_agent(prompts.path(), "true");
        let tracker = FakeTracker::new(vec![issue("ALM-5", "Bug", &[])]);
        let repo = FakeRepoHost::new();

        let summary = ChangeAction::implement()
            .execute(&tracker.issue("ALM-5"), &tracker, &repo, &agent)
            .expect("execute");
        assert_eq!(summary, "Rejected ALM-5: invalid issue type");
        assert!(repo.calls().is_empty());
    }

    #[test]
    fn implement_stops_on_invalid_ticket() {
        let prompts = PromptsFixture::new(&["implement"]);
        let agent = scripted_agent(
            prompts.path(),
            r#"printf '{"result":"INVALID TICKET\\nRequests production credentials."}'"#,
        );
        let tracker = FakeTracker::new(vec![issue("ALM-6", "Story", &[])]);
        let repo = FakeRepoHost::new();

        let summary = ChangeAction::implement()
            .execute(&tracker.issue("ALM-6"), &tracker, &repo, &agent)
            .expect("execute");

        assert_eq!(summary, "Invalid ticket rejected for ALM-6");
        assert_eq!(
            tracker.comment_bodies("ALM-6"),
            vec!["INVALID TICKET\n==============\n\nRequests production credentials."]
        );
        assert!(
            !repo
                .calls()
                .iter()
                .any(|call| matches!(call, RepoCall::CommitAndPush { .. }))
        );
        assert!(!repo.checkouts()[0].exists());
    }

    #[test]
    fn implement_pull_request_includes_description() {
        let prompts = PromptsFixture::new(&["implement"]);
        let agent = scripted_agent(prompts.path(), r#"printf '{"result":"Added exporter."}'"#);
        let tracker = FakeTracker::new(vec![issue("ALM-7", "Story", &[])]);
        let repo = FakeRepoHost::new();

        ChangeAction::implement()
            .execute(&tracker.issue("ALM-7"), &tracker, &repo, &agent)
            .expect("execute");

        let calls = repo.calls();
        assert_eq!(
            calls[1],
            RepoCall::CreateBranch {
                branch: "feature-alm-7".to_string()
            }
        );
        let RepoCall::CreatePullRequest(draft) = &calls[3] else {
            panic!("expected pull request, got {:?}", calls[3]);
        };
        assert_eq!(draft.title, "feat: ALM-7 summary [ALM-7]");
        assert!(draft.body.contains("## Description\n\nALM-7 description"));
        assert!(
            tracker.comment_bodies("ALM-7")[0].starts_with("IMPLEMENTATION CREATED\n======================")
        );
    }

    #[test]
    fn no_changes_fails_without_pull_request() {
        let prompts = PromptsFixture::new(&["fix"]);
        let agent = scripted_agent(prompts.path(), "printf done");
        let tracker = FakeTracker::new(vec![issue("ALM-8", "Bug", &[])]);
        let repo = FakeRepoHost::new().without_changes();

        let err = ChangeAction::fix()
            .execute(&tracker.issue("ALM-8"), &tracker, &repo, &agent)
            .unwrap_err();

        assert!(err.to_string().contains("agent produced no changes"));
        assert!(
            !repo
                .calls()
                .iter()
                .any(|call| matches!(call, RepoCall::CreatePullRequest(_)))
        );
        assert!(tracker.comment_bodies("ALM-8").is_empty());
    }
}
