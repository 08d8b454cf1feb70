//! Git adapter for scratch checkouts.
//!
//! Actions clone, branch, commit and push through a small, explicit wrapper
//! around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Author identity used for commits made on behalf of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Shallow-clone `branch` of `url` into `dest` (which must be empty or absent).
    ///
    /// `url` may embed credentials; it is never logged or included in errors.
    #[instrument(skip_all, fields(branch = %branch, dest = %dest.display()))]
    pub fn clone_shallow(url: &str, branch: &str, dest: &Path) -> Result<Self> {
        debug!("cloning repository");
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--branch", branch, url])
            .arg(dest)
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = redact(&String::from_utf8_lossy(&output.stderr), url);
            return Err(anyhow!("git clone failed: {}", stderr.trim()));
        }
        Ok(Self::new(dest))
    }

    /// Return the current branch name.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str, author: &CommitAuthor) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.run_checked(&["-c", &name, "-c", &email, "commit", "-m", message])?;
        Ok(true)
    }

    /// Point `origin` at `url`.
    pub fn set_origin_url(&self, url: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", "origin", url])?;
        Ok(())
    }

    /// Read back the configured `origin` URL.
    pub fn origin_url(&self) -> Result<String> {
        let out = self.run_capture(&["remote", "get-url", "origin"])?;
        Ok(out.trim().to_string())
    }

    /// Push `branch` to `url` without recording `url` in the checkout's config.
    ///
    /// `url` may embed credentials; it is never logged or included in errors.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn push_to(&self, url: &str, branch: &str) -> Result<()> {
        debug!(branch, "pushing branch");
        let refspec = format!("{branch}:refs/heads/{branch}");
        let output = self.run(&["push", url, &refspec])?;
        if !output.status.success() {
            let stderr = redact(&String::from_utf8_lossy(&output.stderr), url);
            return Err(anyhow!("git push failed: {}", stderr.trim()));
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn redact(text: &str, url: &str) -> String {
    let mut out = text.replace(url, "<repository url>");
    if let Some((_, without_scheme)) = url.split_once("://") {
        out = out.replace(without_scheme, "<repository url>");
    }
    out
}
