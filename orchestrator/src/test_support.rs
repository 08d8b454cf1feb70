//! Test-only collaborators and fixtures.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, TimeDelta, Utc};
use tempfile::TempDir;

use crate::core::types::{Comment, Issue, PrInfo, PullRequest, PullRequestDraft};
use crate::io::agent::AgentExecutor;
use crate::io::config::AgentConfig;
use crate::io::repo::{RepoHost, ScratchCheckout};
use crate::io::tracker::Tracker;

/// Account id the fake tracker posts comments as.
pub const BOT_ACCOUNT: &str = "orchestrator-bot";

/// Policy written by [`PromptsFixture`] for every action.
pub const DEFAULT_POLICY: &str = r#"{"permissions":{"allow":["Read","Grep","Glob"],"deny":[]}}"#;

/// Issue with deterministic summary/description and the given labels.
pub fn issue(key: &str, issue_type: &str, labels: &[&str]) -> Issue {
    Issue {
        key: key.to_string(),
        issue_type: issue_type.to_string(),
        summary: format!("{key} summary"),
        description: format!("{key} description"),
        labels: labels.iter().map(|label| label.to_string()).collect(),
    }
}

/// Prompt catalog in a temp dir: `{action}.md` and `{action}.json` per action.
pub struct PromptsFixture {
    dir: TempDir,
}

impl PromptsFixture {
    pub fn new(actions: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("prompts tempdir");
        for action in actions {
            fs::write(
                dir.path().join(format!("{action}.md")),
                format!("{action} {{issue_key}}: {{issue_summary}}\n"),
            )
            .expect("write template");
            fs::write(dir.path().join(format!("{action}.json")), DEFAULT_POLICY)
                .expect("write policy");
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Executor whose "agent" is `sh -c script`; `$0` is `-p` and `$1` the prompt.
pub fn scripted_agent(prompts_dir: &Path, script: &str) -> AgentExecutor {
    let config = AgentConfig {
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        timeout_secs: 30,
        output_limit_bytes: 1_000_000,
    };
    AgentExecutor::new(prompts_dir, &config)
}

/// Run git in `dir`, panicking on failure.
pub fn git_in(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Bare repository at `root/name` with one commit (`README.md`) on `main`.
pub fn seeded_origin(root: &Path, name: &str) -> PathBuf {
    let origin = root.join(name);
    let seed = root.join(format!("{name}.seed"));
    fs::create_dir_all(&origin).expect("origin dir");
    fs::create_dir_all(&seed).expect("seed dir");
    git_in(&origin, &["init", "--bare", "-b", "main"]);
    git_in(&seed, &["init", "-b", "main"]);
    fs::write(seed.join("README.md"), "hello\n").expect("write readme");
    git_in(&seed, &["add", "."]);
    git_in(
        &seed,
        &[
            "-c",
            "user.name=Seed",
            "-c",
            "user.email=seed@local.invalid",
            "commit",
            "-m",
            "seed",
        ],
    );
    git_in(&seed, &["push", origin.to_str().expect("utf8 path"), "main"]);
    origin
}

#[derive(Debug, Default)]
struct TrackerState {
    issues: BTreeMap<String, Issue>,
    comments: BTreeMap<String, Vec<Comment>>,
    ops: Vec<String>,
}

/// In-memory tracker. Every mutation is appended to [`FakeTracker::ops`].
pub struct FakeTracker {
    state: RefCell<TrackerState>,
    clock: Cell<DateTime<Utc>>,
    fail_search: Cell<bool>,
    fail_add_label: RefCell<Option<String>>,
}

impl FakeTracker {
    pub fn new(issues: Vec<Issue>) -> Self {
        let state = TrackerState {
            issues: issues
                .into_iter()
                .map(|issue| (issue.key.clone(), issue))
                .collect(),
            ..TrackerState::default()
        };
        Self {
            state: RefCell::new(state),
            clock: Cell::new(DateTime::<Utc>::UNIX_EPOCH),
            fail_search: Cell::new(false),
            fail_add_label: RefCell::new(None),
        }
    }

    pub fn issue(&self, key: &str) -> Issue {
        self.state.borrow().issues[key].clone()
    }

    pub fn labels(&self, key: &str) -> Vec<String> {
        self.issue(key).labels.into_iter().collect()
    }

    /// Comment bodies on `key` in the order they were added.
    pub fn comment_bodies(&self, key: &str) -> Vec<String> {
        self.state
            .borrow()
            .comments
            .get(key)
            .map(|comments| comments.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.borrow().ops.clone()
    }

    /// Add a comment as `author` without recording an op.
    pub fn seed_comment(&self, key: &str, author: &str, body: &str) {
        let created = self.tick();
        self.state
            .borrow_mut()
            .comments
            .entry(key.to_string())
            .or_default()
            .push(Comment {
                body: body.to_string(),
                author_id: author.to_string(),
                created,
            });
    }

    pub fn fail_search(&self) {
        self.fail_search.set(true);
    }

    /// Make `add_label(_, label)` fail.
    pub fn fail_add_label(&self, label: &str) {
        *self.fail_add_label.borrow_mut() = Some(label.to_string());
    }

    fn tick(&self) -> DateTime<Utc> {
        let next = self.clock.get() + TimeDelta::seconds(1);
        self.clock.set(next);
        next
    }

    fn with_issue<R>(&self, key: &str, f: impl FnOnce(&mut Issue) -> R) -> Result<R> {
        let mut state = self.state.borrow_mut();
        let issue = state
            .issues
            .get_mut(key)
            .ok_or_else(|| anyhow!("issue {key} not found"))?;
        Ok(f(issue))
    }
}

impl Tracker for FakeTracker {
    fn search_candidates(&self, intent_labels: &[String], lock_label: &str) -> Result<Vec<Issue>> {
        if self.fail_search.get() {
            bail!("tracker unavailable");
        }
        let state = self.state.borrow();
        Ok(state
            .issues
            .values()
            .filter(|issue| !issue.has_label(lock_label))
            .filter(|issue| intent_labels.iter().any(|label| issue.has_label(label)))
            .cloned()
            .collect())
    }

    fn add_label(&self, issue_key: &str, label: &str) -> Result<()> {
        if self.fail_add_label.borrow().as_deref() == Some(label) {
            bail!("cannot add label {label}");
        }
        self.with_issue(issue_key, |issue| issue.labels.insert(label.to_string()))?;
        self.state
            .borrow_mut()
            .ops
            .push(format!("add_label {issue_key} {label}"));
        Ok(())
    }

    fn remove_label(&self, issue_key: &str, label: &str) -> Result<()> {
        self.with_issue(issue_key, |issue| issue.labels.remove(label))?;
        self.state
            .borrow_mut()
            .ops
            .push(format!("remove_label {issue_key} {label}"));
        Ok(())
    }

    fn add_comment(&self, issue_key: &str, body: &str) -> Result<()> {
        self.with_issue(issue_key, |_| ())?;
        self.seed_comment(issue_key, BOT_ACCOUNT, body);
        self.state
            .borrow_mut()
            .ops
            .push(format!("add_comment {issue_key}"));
        Ok(())
    }

    fn comments(&self, issue_key: &str) -> Result<Vec<Comment>> {
        let mut comments = self
            .state
            .borrow()
            .comments
            .get(issue_key)
            .cloned()
            .unwrap_or_default();
        comments.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(comments)
    }

    fn account_id(&self) -> Result<String> {
        Ok(BOT_ACCOUNT.to_string())
    }
}

/// Call recorded by [`FakeRepoHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoCall {
    Clone { branch: String },
    CreateBranch { branch: String },
    CommitAndPush { branch: String, message: String },
    CreatePullRequest(PullRequestDraft),
    PrComment { number: u64, body: String },
    PrInfo { number: u64 },
}

/// Repository host that hands out empty scratch checkouts and records calls.
pub struct FakeRepoHost {
    calls: RefCell<Vec<RepoCall>>,
    checkouts: RefCell<Vec<PathBuf>>,
    pr_info: BTreeMap<u64, PrInfo>,
    /// Whether `commit_and_push` finds anything to commit.
    changed: Cell<bool>,
}

impl Default for FakeRepoHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRepoHost {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            checkouts: RefCell::new(Vec::new()),
            pr_info: BTreeMap::new(),
            changed: Cell::new(true),
        }
    }

    pub fn with_pr(mut self, number: u64, info: PrInfo) -> Self {
        self.pr_info.insert(number, info);
        self
    }

    /// Make `commit_and_push` fail as if the agent changed nothing.
    pub fn without_changes(self) -> Self {
        self.changed.set(false);
        self
    }

    pub fn calls(&self) -> Vec<RepoCall> {
        self.calls.borrow().clone()
    }

    /// Paths of every scratch checkout handed out so far.
    pub fn checkouts(&self) -> Vec<PathBuf> {
        self.checkouts.borrow().clone()
    }

    fn record(&self, call: RepoCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl RepoHost for FakeRepoHost {
    fn base_branch(&self) -> &str {
        "main"
    }

    fn clone_repo(&self, branch: &str) -> Result<ScratchCheckout> {
        self.record(RepoCall::Clone {
            branch: branch.to_string(),
        });
        let checkout = ScratchCheckout::new()?;
        fs::write(checkout.path().join("README.md"), "hello\n")?;
        self.checkouts
            .borrow_mut()
            .push(checkout.path().to_path_buf());
        Ok(checkout)
    }

    fn create_branch(&self, _checkout: &ScratchCheckout, branch: &str) -> Result<()> {
        self.record(RepoCall::CreateBranch {
            branch: branch.to_string(),
        });
        Ok(())
    }

    fn commit_and_push(
        &self,
        _checkout: &ScratchCheckout,
        branch: &str,
        message: &str,
    ) -> Result<()> {
        if !self.changed.get() {
            bail!("agent produced no changes");
        }
        self.record(RepoCall::CommitAndPush {
            branch: branch.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    fn create_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest> {
        self.record(RepoCall::CreatePullRequest(draft.clone()));
        Ok(PullRequest {
            number: 101,
            url: "https://github.com/acme/widgets/pull/101".to_string(),
        })
    }

    fn add_pr_comment(&self, number: u64, body: &str) -> Result<()> {
        self.record(RepoCall::PrComment {
            number,
            body: body.to_string(),
        });
        Ok(())
    }

    fn pr_info(&self, number: u64) -> Result<PrInfo> {
        self.record(RepoCall::PrInfo { number });
        self.pr_info
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("pull request #{number} not found"))
    }
}
