//! Agent invocation: prompt rendering, policy installation, subprocess execution
//! and result parsing.
//!
//! Every invocation follows the same protocol:
//!
//! 1. Render `{prompts_dir}/{action}.md` with the caller's context (see
//!    [`crate::core::template`] for how tracker text is kept inert).
//! 2. Copy `{prompts_dir}/{action}.json` to `.claude/settings.local.json` inside
//!    the checkout. A missing or malformed policy aborts before the agent runs.
//! 3. Run `{command...} -p <prompt> --output-format json` in the checkout with a
//!    hard timeout.
//! 4. Parse the JSON envelope on stdout, degrading to raw text when it does not
//!    parse.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::template::render_template;
use crate::core::types::{AgentResult, PermissionDenial};
use crate::io::config::AgentConfig;
use crate::io::process::run_command_with_timeout;

const POLICY_SCHEMA: &str = include_str!("schemas/policy.schema.json");

/// Directory (relative to the checkout) the agent reads local settings from.
pub const POLICY_DIR: &str = ".claude";
/// Settings file that takes precedence over repository-tracked settings.
pub const POLICY_FILE: &str = "settings.local.json";

/// The agent did not finish within its wall-clock limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTimeoutError {
    pub timeout: Duration,
}

impl fmt::Display for AgentTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent timed out after {} seconds", self.timeout.as_secs())
    }
}

impl std::error::Error for AgentTimeoutError {}

/// The agent exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExecutionError {
    pub exit_code: Option<i32>,
    /// Captured stderr, else stdout, else a placeholder.
    pub diagnostics: String,
}

impl fmt::Display for AgentExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "agent failed with exit code {code}: {}", self.diagnostics),
            None => write!(f, "agent failed: {}", self.diagnostics),
        }
    }
}

impl std::error::Error for AgentExecutionError {}

/// No policy descriptor exists for the requested action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPolicyError {
    pub action: String,
    pub path: PathBuf,
}

impl fmt::Display for MissingPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "policy for action '{}' not found: {}",
            self.action,
            self.path.display()
        )
    }
}

impl std::error::Error for MissingPolicyError {}

/// A policy descriptor exists but is not a valid permission document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPolicyError {
    pub action: String,
    pub problems: Vec<String>,
}

impl fmt::Display for InvalidPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "policy for action '{}' is invalid:\n- {}",
            self.action,
            self.problems.join("\n- ")
        )
    }
}

impl std::error::Error for InvalidPolicyError {}

/// JSON envelope printed by the agent with `--output-format json`.
#[derive(Debug, Deserialize)]
struct AgentEnvelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default, alias = "total_cost_usd")]
    cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    permission_denials: Vec<PermissionDenial>,
}

/// Runs the external coding agent against a checkout.
#[derive(Debug, Clone)]
pub struct AgentExecutor {
    prompts_dir: PathBuf,
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl AgentExecutor {
    pub fn new(prompts_dir: impl Into<PathBuf>, config: &AgentConfig) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    /// Override the wall-clock limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prompts_dir(&self) -> &Path {
        &self.prompts_dir
    }

    pub fn template_path(&self, action: &str) -> PathBuf {
        self.prompts_dir.join(format!("{action}.md"))
    }

    pub fn policy_path(&self, action: &str) -> PathBuf {
        self.prompts_dir.join(format!("{action}.json"))
    }

    /// Render the instruction template for `action`.
    pub fn render_prompt(&self, action: &str, context: &Map<String, Value>) -> Result<String> {
        let path = self.template_path(action);
        let template = fs::read_to_string(&path)
            .with_context(|| format!("read template {}", path.display()))?;
        Ok(render_template(&template, context))
    }

    /// Render the template for `action` and run the agent with it.
    #[instrument(skip_all, fields(action = %action))]
    pub fn execute_with_template(
        &self,
        workdir: &Path,
        action: &str,
        context: &Map<String, Value>,
    ) -> Result<AgentResult> {
        let prompt = self.render_prompt(action, context)?;
        self.execute(workdir, &prompt, action)
    }

    /// Run the agent in `workdir` under the policy for `action`.
    #[instrument(skip_all, fields(action = %action, workdir = %workdir.display()))]
    pub fn execute(&self, workdir: &Path, prompt: &str, action: &str) -> Result<AgentResult> {
        self.install_policy(workdir, action)?;

        let (program, leading_args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading_args)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .current_dir(workdir);

        info!(timeout_secs = self.timeout.as_secs(), "starting agent");
        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .context("run agent")?;
        debug!(elapsed_ms = output.elapsed.as_millis() as u64, "agent finished");

        if output.timed_out {
            return Err(AgentTimeoutError {
                timeout: self.timeout,
            }
            .into());
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            let stdout = output.stdout_lossy();
            let diagnostics = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|text| !text.is_empty())
                .unwrap_or("unknown error")
                .to_string();
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(AgentExecutionError {
                exit_code: output.status.code(),
                diagnostics,
            }
            .into());
        }

        let result = parse_agent_output(&output.stdout_lossy());
        if !result.permission_denials.is_empty() {
            let denied: Vec<&str> = result
                .permission_denials
                .iter()
                .map(|denial| denial.tool.as_str())
                .collect();
            warn!(
                action,
                denied_tools = ?denied,
                details = ?result.permission_denials,
                "agent hit permission denials; tool allowance may be too narrow or the prompt attempted a disallowed action"
            );
        }
        Ok(result)
    }

    /// Copy the policy for `action` into the checkout, failing closed.
    pub fn install_policy(&self, workdir: &Path, action: &str) -> Result<PathBuf> {
        let src = self.policy_path(action);
        if !src.is_file() {
            return Err(MissingPolicyError {
                action: action.to_string(),
                path: src,
            }
            .into());
        }
        validate_policy(action, &src)?;

        let dir = workdir.join(POLICY_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let dst = dir.join(POLICY_FILE);
        fs::copy(&src, &dst)
            .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        debug!(action, dst = %dst.display(), "installed policy");
        Ok(dst)
    }
}

fn validate_policy(action: &str, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let instance: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            return Err(InvalidPolicyError {
                action: action.to_string(),
                problems: vec![format!("not valid JSON: {err}")],
            }
            .into());
        }
    };
    let schema: Value = serde_json::from_str(POLICY_SCHEMA).context("parse policy schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile policy schema")?;
    let problems: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !problems.is_empty() {
        return Err(InvalidPolicyError {
            action: action.to_string(),
            problems,
        }
        .into());
    }
    Ok(())
}

/// Parse agent stdout, falling back to the raw text when it is not a JSON envelope.
pub fn parse_agent_output(stdout: &str) -> AgentResult {
    match serde_json::from_str::<AgentEnvelope>(stdout) {
        Ok(envelope) => AgentResult {
            content: envelope.result.unwrap_or_default(),
            cost_usd: envelope.cost_usd.unwrap_or(0.0),
            duration_ms: envelope.duration_ms.unwrap_or(0),
            session_id: envelope.session_id.unwrap_or_default(),
            permission_denials: envelope.permission_denials,
        },
        Err(err) => {
            debug!(err = %err, "agent output is not a json envelope, using raw text");
            AgentResult::from_raw(stdout)
        }
    }
}
