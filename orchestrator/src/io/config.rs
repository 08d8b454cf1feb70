//! Orchestrator configuration (`orchestrator.toml`) and environment secrets.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::labels::{DEFAULT_LOCK_LABEL, default_intent_labels};

/// Invalid or incomplete configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Orchestrator configuration (TOML).
///
/// Missing fields fall back to defaults; required identifiers are checked by
/// [`OrchestratorConfig::validate`]. Secrets are referenced by environment
/// variable name and never stored in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds to wait between poll cycles.
    pub poll_interval_secs: u64,
    /// Directory holding `{action}.md` templates and `{action}.json` policies.
    pub prompts_dir: PathBuf,
    pub tracker: TrackerConfig,
    pub oauth: OAuthConfig,
    pub repo: RepoConfig,
    pub agent: AgentConfig,
    pub labels: LabelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub project_key: String,
    /// Upper bound on issues fetched per cycle.
    pub max_results: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Environment variable holding the client secret.
    pub client_secret_env: String,
    pub token_url: String,
    pub resources_url: String,
    /// Root that tenant-scoped API bases are built from.
    pub api_root: String,
    /// Refresh this many seconds before the token actually expires.
    pub expiry_buffer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepoConfig {
    /// Repository in `owner/name` form.
    pub name: String,
    pub base_branch: String,
    pub api_base: String,
    pub clone_base_url: String,
    /// Environment variable holding the repository token.
    pub token_env: String,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and leading arguments for the agent CLI.
    pub command: Vec<String>,
    /// Hard wall-clock limit per invocation.
    pub timeout_secs: u64,
    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LabelConfig {
    pub lock: String,
    pub intent: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            prompts_dir: PathBuf::from("prompts"),
            tracker: TrackerConfig::default(),
            oauth: OAuthConfig::default(),
            repo: RepoConfig::default(),
            agent: AgentConfig::default(),
            labels: LabelConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            project_key: String::new(),
            max_results: 50,
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret_env: "JIRA_OAUTH_CLIENT_SECRET".to_string(),
            token_url: "https://auth.atlassian.com/oauth/token".to_string(),
            resources_url: "https://api.atlassian.com/oauth/token/accessible-resources"
                .to_string(),
            api_root: "https://api.atlassian.com".to_string(),
            expiry_buffer_secs: 300,
        }
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_branch: "main".to_string(),
            api_base: "https://api.github.com".to_string(),
            clone_base_url: "https://github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            author_name: "ALM Orchestrator".to_string(),
            author_email: "alm-orchestrator@users.noreply.github.com".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            timeout_secs: 600,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            lock: DEFAULT_LOCK_LABEL.to_string(),
            intent: default_intent_labels(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| -> Result<()> { Err(ConfigError::new(message).into()) };
        if self.poll_interval_secs == 0 {
            return fail("poll_interval_secs must be > 0");
        }
        if self.tracker.project_key.trim().is_empty() {
            return fail("tracker.project_key is required");
        }
        if self.tracker.max_results == 0 {
            return fail("tracker.max_results must be > 0");
        }
        if self.oauth.client_id.trim().is_empty() {
            return fail("oauth.client_id is required");
        }
        if self.repo.owner_and_name().is_none() {
            return fail("repo.name must be in 'owner/name' form");
        }
        if self.repo.base_branch.trim().is_empty() {
            return fail("repo.base_branch must not be empty");
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return fail("agent.command must be a non-empty array");
        }
        if self.agent.timeout_secs == 0 {
            return fail("agent.timeout_secs must be > 0");
        }
        if self.agent.output_limit_bytes == 0 {
            return fail("agent.output_limit_bytes must be > 0");
        }
        if self.labels.lock.trim().is_empty() {
            return fail("labels.lock must not be empty");
        }
        if self.labels.intent.iter().any(|label| *label == self.labels.lock) {
            return fail("labels.lock must not be one of labels.intent");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl RepoConfig {
    /// Split `owner/name`; `None` when malformed.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        let (owner, name) = self.name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some((owner, name))
    }
}

/// Credentials resolved from the environment.
#[derive(Clone)]
pub struct Secrets {
    pub oauth_client_secret: String,
    pub repo_token: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Secrets {
    /// Read secrets from the process environment.
    pub fn from_env(cfg: &OrchestratorConfig) -> Result<Self> {
        Self::from_lookup(cfg, |name| std::env::var(name).ok())
    }

    /// Resolve secrets through `lookup`; empty values count as missing.
    pub fn from_lookup<F>(cfg: &OrchestratorConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let oauth_client_secret = read(&cfg.oauth.client_secret_env);
        let repo_token = read(&cfg.repo.token_env);

        let mut missing = Vec::new();
        if oauth_client_secret.is_none() {
            missing.push(cfg.oauth.client_secret_env.as_str());
        }
        if repo_token.is_none() {
            missing.push(cfg.repo.token_env.as_str());
        }
        match (oauth_client_secret, repo_token) {
            (Some(oauth_client_secret), Some(repo_token)) => Ok(Self {
                oauth_client_secret,
                repo_token,
            }),
            _ => Err(ConfigError::new(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            ))
            .into()),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, validates `OrchestratorConfig::default()`, which
/// reports the first required field that still needs a value.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()
            .with_context(|| format!("no config at {}", path.display()))?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig = toml::from_str(&contents)
        .map_err(|err| ConfigError::new(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}
