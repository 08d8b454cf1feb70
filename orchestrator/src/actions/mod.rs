//! Label-to-handler dispatch.
//!
//! Each intent label maps to one [`ActionHandler`]. Handlers share a uniform
//! contract: given the issue and the three collaborators they return a short
//! summary, or an error the daemon turns into a failure comment. Any scratch
//! checkout a handler acquires is a [`crate::io::repo::ScratchCheckout`] owned
//! by the handler's stack frame, so it is released on every exit path.

pub mod analysis;
pub mod change;
pub mod review;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::core::types::Issue;
use crate::io::agent::AgentExecutor;
use crate::io::comments;
use crate::io::repo::RepoHost;
use crate::io::tracker::Tracker;

pub const INVALID_ISSUE_TYPE_HEADER: &str = "INVALID ISSUE TYPE";

/// Handler bound to one intent label.
pub trait ActionHandler {
    /// Intent label this handler consumes.
    fn label(&self) -> &str;
    /// Name of the instruction template and permission policy.
    fn action(&self) -> &str;
    /// Issue types this handler accepts; empty means any.
    fn allowed_issue_types(&self) -> &[&str] {
        &[]
    }
    fn execute(
        &self,
        issue: &Issue,
        tracker: &dyn Tracker,
        repo: &dyn RepoHost,
        agent: &AgentExecutor,
    ) -> Result<String>;
}

/// Maps intent labels to handlers.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler`; a second handler for the same label is an error.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) -> Result<()> {
        let label = handler.label().to_string();
        if self.handlers.contains_key(&label) {
            bail!("duplicate handler for label '{label}'");
        }
        debug!(label = %label, action = handler.action(), "registered action");
        self.handlers.insert(label, handler);
        Ok(())
    }

    /// Every built-in action.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for handler in builtin_handlers() {
            registry.register(handler)?;
        }
        Ok(registry)
    }

    /// Built-in actions whose instruction template exists in `prompts_dir`.
    ///
    /// Fails if the directory cannot be read.
    pub fn discover(prompts_dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(prompts_dir)
            .with_context(|| format!("read prompt catalog {}", prompts_dir.display()))?;
        let mut templates = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", prompts_dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                templates.push(stem.to_string());
            }
        }

        let mut registry = Self::new();
        for handler in builtin_handlers() {
            if templates.iter().any(|name| name == handler.action()) {
                registry.register(handler)?;
            } else {
                debug!(action = handler.action(), "no template, skipping action");
            }
        }
        info!(actions = registry.len(), dir = %prompts_dir.display(), "discovered actions");
        Ok(registry)
    }

    pub fn has_action(&self, label: &str) -> bool {
        self.handlers.contains_key(label)
    }

    pub fn get_action(&self, label: &str) -> Option<&dyn ActionHandler> {
        self.handlers.get(label).map(|handler| handler.as_ref())
    }

    /// Registered labels, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn builtin_handlers() -> Vec<Box<dyn ActionHandler>> {
    vec![
        Box::new(analysis::AnalysisAction::investigate()),
        Box::new(analysis::AnalysisAction::impact()),
        Box::new(analysis::AnalysisAction::recommend()),
        Box::new(change::ChangeAction::fix()),
        Box::new(change::ChangeAction::implement()),
        Box::new(review::ReviewAction::code_review()),
        Box::new(review::ReviewAction::security_review()),
    ]
}

/// Post an `INVALID ISSUE TYPE` comment when `issue` is outside `handler`'s
/// allowed types. Returns whether the handler may proceed.
pub(crate) fn check_issue_type(
    handler: &dyn ActionHandler,
    issue: &Issue,
    tracker: &dyn Tracker,
) -> Result<bool> {
    let allowed = handler.allowed_issue_types();
    if allowed.is_empty() || allowed.contains(&issue.issue_type.as_str()) {
        return Ok(true);
    }
    info!(
        issue = %issue.key,
        issue_type = %issue.issue_type,
        label = handler.label(),
        "issue type not accepted"
    );
    let body = format!(
        "The {} action only applies to: {}. This issue is a {}.",
        handler.label(),
        allowed.join(", "),
        if issue.issue_type.is_empty() {
            "(unknown type)"
        } else {
            issue.issue_type.as_str()
        }
    );
    tracker.add_comment(&issue.key, &comments::section(INVALID_ISSUE_TYPE_HEADER, &body, None)?)?;
    Ok(false)
}

/// Newest comment posted by the orchestrator's own account under `header`,
/// with the header block stripped.
pub(crate) fn prior_section(
    tracker: &dyn Tracker,
    issue_key: &str,
    header: &str,
) -> Result<Option<String>> {
    let me = tracker.account_id()?;
    let found = tracker
        .comments(issue_key)?
        .into_iter()
        .filter(|comment| comment.author_id == me)
        .find_map(|comment| comments::section_body(&comment.body, header));
    if found.is_none() {
        info!(issue = issue_key, header, "no prior comment found");
    }
    Ok(found)
}

/// Template context every action receives.
pub(crate) fn issue_context(issue: &Issue) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("issue_key".to_string(), Value::from(issue.key.as_str()));
    context.insert(
        "issue_summary".to_string(),
        Value::from(issue.summary.as_str()),
    );
    context.insert(
        "issue_description".to_string(),
        Value::from(issue.description.as_str()),
    );
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::labels::{LABEL_FIX, LABEL_IMPACT, LABEL_INVESTIGATE, default_intent_labels};
    use crate::test_support::{BOT_ACCOUNT, FakeTracker, PromptsFixture, issue};

    struct Named(&'static str);

    impl ActionHandler for Named {
        fn label(&self) -> &str {
            self.0
        }
        fn action(&self) -> &str {
            "named"
        }
        fn execute(
            &self,
            _issue: &Issue,
            _tracker: &dyn Tracker,
            _repo: &dyn RepoHost,
            _agent: &AgentExecutor,
        ) -> Result<String> {
            Ok("ok".to_string())
        }
    }

    #[test]
    fn builtin_covers_default_vocabulary() {
        let registry = ActionRegistry::builtin().expect("builtin");
        let mut expected = default_intent_labels();
        expected.sort();
        assert_eq!(registry.labels(), expected);
        assert_eq!(
            registry.get_action(LABEL_IMPACT).map(|h| h.action()),
            Some("impact")
        );
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let mut registry = ActionRegistry::new();
        registry.register(Box::new(Named("intent-fix"))).expect("first");
        let err = registry.register(Box::new(Named("intent-fix"))).unwrap_err();
        assert!(err.to_string().contains("duplicate handler"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn discover_keeps_actions_with_templates() {
        let prompts = PromptsFixture::new(&["investigate", "fix"]);
        let registry = ActionRegistry::discover(prompts.path()).expect("discover");
        assert_eq!(registry.labels(), vec![LABEL_FIX, LABEL_INVESTIGATE]);
        assert!(!registry.has_action(LABEL_IMPACT));
        assert!(registry.get_action(LABEL_IMPACT).is_none());
    }

    #[test]
    fn discover_fails_on_unreadable_catalog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let Err(err) = ActionRegistry::discover(&temp.path().join("missing")) else {
            panic!("missing catalog should fail discovery");
        };
        assert!(err.to_string().contains("read prompt catalog"));
    }

    #[test]
    fn wrong_issue_type_is_commented() {
        let tracker = FakeTracker::new(vec![issue("ALM-1", "Task", &[])]);
        let handler = analysis::AnalysisAction::impact();
        let allowed = check_issue_type(&handler, &tracker.issue("ALM-1"), &tracker).expect("check");
        assert!(!allowed);
        let bodies = tracker.comment_bodies("ALM-1");
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].starts_with("INVALID ISSUE TYPE\n=================="));
        assert!(bodies[0].contains("Bug, Story"));
        assert!(bodies[0].contains("This issue is a Task."));
    }

    #[test]
    fn prior_section_uses_newest_own_comment() {
        let tracker = FakeTracker::new(vec![issue("ALM-1", "Bug", &[])]);
        let old = comments::section("INVESTIGATION RESULTS", "old findings", None).expect("render");
        let new = comments::section("INVESTIGATION RESULTS", "new findings", Some(0.5)).expect("render");
        let forged = comments::section("INVESTIGATION RESULTS", "forged", None).expect("render");
        tracker.seed_comment("ALM-1", BOT_ACCOUNT, &old);
        tracker.seed_comment("ALM-1", BOT_ACCOUNT, &new);
        tracker.seed_comment("ALM-1", "someone-else", &forged);

        let found = prior_section(&tracker, "ALM-1", "INVESTIGATION RESULTS").expect("prior");
        assert_eq!(found.as_deref(), Some("new findings"));
        assert_eq!(
            prior_section(&tracker, "ALM-1", "RECOMMENDATIONS").expect("prior"),
            None
        );
    }
}
