//! Repository-hosting collaborator: the [`RepoHost`] contract, scratch
//! checkouts, and the GitHub adapter.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tempfile::TempDir;
use tracing::{debug, info, instrument};

use crate::core::types::{PrInfo, PullRequest, PullRequestDraft};
use crate::io::config::RepoConfig;
use crate::io::git::{CommitAuthor, Git};
use crate::io::oauth::truncate_for_error;

pub const SCRATCH_PREFIX: &str = "alm-orchestrator-";

/// Temporary working tree owned by one handler invocation.
///
/// Dropping it removes the directory recursively; removal errors are ignored.
#[derive(Debug)]
pub struct ScratchCheckout {
    dir: TempDir,
}

impl ScratchCheckout {
    /// Fresh, empty scratch directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir()
            .context("create scratch directory")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.dir.path())
    }
}

impl Drop for ScratchCheckout {
    fn drop(&mut self) {
        debug!(path = %self.dir.path().display(), "removing scratch checkout");
    }
}

/// Operations the actions need from the repository host.
pub trait RepoHost {
    /// Branch new work is based on and pull requests target.
    fn base_branch(&self) -> &str;
    fn clone_repo(&self, branch: &str) -> Result<ScratchCheckout>;
    fn create_branch(&self, checkout: &ScratchCheckout, branch: &str) -> Result<()>;
    /// Stage everything, commit, push. Fails when there is nothing to commit.
    fn commit_and_push(&self, checkout: &ScratchCheckout, branch: &str, message: &str)
    -> Result<()>;
    fn create_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest>;
    fn add_pr_comment(&self, number: u64, body: &str) -> Result<()>;
    fn pr_info(&self, number: u64) -> Result<PrInfo>;
}

/// Token-free repository URL, as stored in a checkout's `origin`.
pub fn repository_url(clone_base_url: &str, repo: &str) -> String {
    format!("{}/{repo}.git", clone_base_url.trim_end_matches('/'))
}

/// Clone URL with the token embedded for http(s) hosts.
pub fn authenticated_clone_url(clone_base_url: &str, repo: &str, token: &str) -> String {
    let base = clone_base_url.trim_end_matches('/');
    match base.split_once("://") {
        Some((scheme, rest)) if scheme.starts_with("http") => {
            format!("{scheme}://x-access-token:{token}@{rest}/{repo}.git")
        }
        _ => format!("{base}/{repo}.git"),
    }
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    number: u64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PullRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullDetails {
    head: PullRef,
    base: PullRef,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullFile {
    filename: String,
}

/// GitHub REST plus `git` subprocesses for one repository.
pub struct GithubClient {
    http: reqwest::blocking::Client,
    api_base: String,
    repo: String,
    base_branch: String,
    clone_url: String,
    public_url: String,
    author: CommitAuthor,
}

impl GithubClient {
    pub fn new(config: &RepoConfig, token: &str, request_timeout: Duration) -> Result<Self> {
        let (owner, name) = config
            .owner_and_name()
            .ok_or_else(|| anyhow!("repo.name must be in 'owner/name' form"))?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("alm-orchestrator"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        let auth_header = format!("Bearer {}", token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid github authorization header")?,
        );
        let http = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .context("failed to create github api client")?;

        let repo = format!("{owner}/{name}");
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            clone_url: authenticated_clone_url(&config.clone_base_url, &repo, token.trim()),
            public_url: repository_url(&config.clone_base_url, &repo),
            repo,
            base_branch: config.base_branch.clone(),
            author: CommitAuthor {
                name: config.author_name.clone(),
                email: config.author_email.clone(),
            },
        })
    }

    fn repo_url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{tail}", self.api_base, self.repo)
    }

    fn send(
        &self,
        operation: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response> {
        let response = request
            .send()
            .with_context(|| format!("github {operation} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "github {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        Ok(response)
    }

    fn request_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<T> {
        self.send(operation, request)?
            .json()
            .with_context(|| format!("failed to decode github {operation}"))
    }
}

impl RepoHost for GithubClient {
    fn base_branch(&self) -> &str {
        &self.base_branch
    }

    #[instrument(skip_all, fields(repo = %self.repo, branch = %branch))]
    fn clone_repo(&self, branch: &str) -> Result<ScratchCheckout> {
        let checkout = ScratchCheckout::new()?;
        info!(path = %checkout.path().display(), "cloning repository");
        let git = Git::clone_shallow(&self.clone_url, branch, checkout.path())?;
        // The agent works in this tree; keep the token out of `.git/config`.
        git.set_origin_url(&self.public_url)?;
        Ok(checkout)
    }

    fn create_branch(&self, checkout: &ScratchCheckout, branch: &str) -> Result<()> {
        info!(branch, "creating branch");
        checkout.git().checkout_new_branch(branch)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    fn commit_and_push(
        &self,
        checkout: &ScratchCheckout,
        branch: &str,
        message: &str,
    ) -> Result<()> {
        let git = checkout.git();
        git.add_all()?;
        if !git.commit_staged(message, &self.author)? {
            bail!("agent produced no changes");
        }
        git.push_to(&self.clone_url, branch)?;
        info!("pushed branch");
        Ok(())
    }

    #[instrument(skip_all, fields(head = %draft.branch, base = %draft.base))]
    fn create_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest> {
        let payload = json!({
            "title": draft.title,
            "body": draft.body,
            "head": draft.branch,
            "base": draft.base,
        });
        let created: CreatedPull = self.request_json(
            "create pull request",
            self.http.post(self.repo_url("pulls")).json(&payload),
        )?;
        info!(number = created.number, "pull request created");
        Ok(PullRequest {
            number: created.number,
            url: created.html_url,
        })
    }

    fn add_pr_comment(&self, number: u64, body: &str) -> Result<()> {
        debug!(number, "adding pull request comment");
        self.send(
            "add pull request comment",
            self.http
                .post(self.repo_url(&format!("issues/{number}/comments")))
                .json(&json!({ "body": body })),
        )?;
        Ok(())
    }

    fn pr_info(&self, number: u64) -> Result<PrInfo> {
        let details: PullDetails = self.request_json(
            "get pull request",
            self.http.get(self.repo_url(&format!("pulls/{number}"))),
        )?;
        let files: Vec<PullFile> = self.request_json(
            "list pull request files",
            self.http
                .get(self.repo_url(&format!("pulls/{number}/files")))
                .query(&[("per_page", "100")]),
        )?;
        Ok(PrInfo {
            head_branch: details.head.name,
            base_branch: details.base.name,
            changed_files: files.into_iter().map(|file| file.filename).collect(),
            title: details.title,
            body: details.body.unwrap_or_default(),
        })
    }
}
