//! Label-driven automation daemon.
//!
//! Polls the issue tracker for issues carrying intent labels and dispatches each
//! label to its action, which drives the coding agent against a scratch
//! checkout and reports back on the issue or through a pull request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alm_orchestrator::actions::ActionRegistry;
use alm_orchestrator::daemon::{Daemon, StopFlag};
use alm_orchestrator::exit_codes;
use alm_orchestrator::io::agent::AgentExecutor;
use alm_orchestrator::io::config::{ConfigError, OrchestratorConfig, Secrets, load_config};
use alm_orchestrator::io::oauth::{HttpTokenTransport, OAuthTokenManager, SystemClock};
use alm_orchestrator::io::repo::GithubClient;
use alm_orchestrator::io::tracker::JiraClient;
use alm_orchestrator::logging;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

/// Per-request limit for tracker, OAuth and repository HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

type ProductionDaemon = Daemon<JiraClient<HttpTokenTransport, SystemClock>, GithubClient>;

#[derive(Parser)]
#[command(
    name = "alm-orchestrator",
    version,
    about = "Label-driven automation daemon for issue trackers"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "orchestrator.toml")]
    config: PathBuf,
    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll until interrupted (SIGINT/SIGTERM).
    Run {
        /// Seconds between poll cycles; overrides the config file.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        poll_interval: Option<u64>,
    },
    /// Run a single poll cycle and exit.
    Once,
    /// List candidate issues and their worklists without claiming anything.
    Check,
    /// List the label-to-action mappings found in the prompt catalog.
    Actions,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<ConfigError>().is_some() {
                exit_codes::INVALID
            } else {
                exit_codes::FAILURE
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)?;
    match cli.command {
        Command::Run { poll_interval } => {
            if let Some(secs) = poll_interval {
                config.poll_interval_secs = secs;
            }
            cmd_run(&config)
        }
        Command::Once => cmd_once(&config),
        Command::Check => cmd_check(&config),
        Command::Actions => cmd_actions(&config.prompts_dir),
    }
}

fn build_daemon(config: &OrchestratorConfig) -> Result<ProductionDaemon> {
    let secrets = Secrets::from_env(config)?;
    let transport = HttpTokenTransport::new(
        &config.oauth.token_url,
        &config.oauth.resources_url,
        &config.oauth.client_id,
        &secrets.oauth_client_secret,
        HTTP_TIMEOUT,
    )?;
    let oauth = OAuthTokenManager::new(
        transport,
        SystemClock,
        &config.oauth.api_root,
        Duration::from_secs(config.oauth.expiry_buffer_secs),
    );
    let tracker = JiraClient::new(
        oauth,
        &config.tracker.project_key,
        config.tracker.max_results,
        HTTP_TIMEOUT,
    )?;
    let repo = GithubClient::new(&config.repo, &secrets.repo_token, HTTP_TIMEOUT)?;
    let registry = ActionRegistry::discover(&config.prompts_dir)?;
    let agent = AgentExecutor::new(&config.prompts_dir, &config.agent);
    Ok(Daemon::new(
        tracker,
        repo,
        registry,
        agent,
        &config.labels,
        config.poll_interval(),
    ))
}

fn cmd_run(config: &OrchestratorConfig) -> Result<()> {
    let daemon = build_daemon(config)?;
    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested; finishing current cycle");
        handler_stop.request_stop();
    })
    .context("install signal handler")?;
    daemon.run(&stop);
    Ok(())
}

fn cmd_once(config: &OrchestratorConfig) -> Result<()> {
    let daemon = build_daemon(config)?;
    let report = daemon.poll_once()?;
    println!(
        "candidates: {}, processed: {}, failed: {}",
        report.candidates, report.processed, report.failed
    );
    Ok(())
}

fn cmd_check(config: &OrchestratorConfig) -> Result<()> {
    let daemon = build_daemon(config)?;
    let candidates = daemon.candidates()?;
    if candidates.is_empty() {
        println!("no candidate issues");
    }
    for candidate in candidates {
        let (handled, unhandled): (Vec<String>, Vec<String>) = candidate
            .worklist
            .into_iter()
            .partition(|label| daemon.registry().has_action(label));
        print!(
            "{} [{}]: {}",
            candidate.issue.key,
            candidate.issue.issue_type,
            handled.join(", ")
        );
        if !unhandled.is_empty() {
            print!(" (no handler: {})", unhandled.join(", "));
        }
        println!();
    }
    Ok(())
}

fn cmd_actions(prompts_dir: &Path) -> Result<()> {
    let registry = ActionRegistry::discover(prompts_dir)?;
    if registry.is_empty() {
        println!("no actions found in {}", prompts_dir.display());
    }
    for label in registry.labels() {
        if let Some(handler) = registry.get_action(label) {
            println!("{label} -> {}", handler.action());
        }
    }
    Ok(())
}
