//! Poll/lock state machine for `alm-orchestrator run` and `once`.
//!
//! Per (issue, intent label) the daemon moves through:
//!
//! - **unclaimed**: intent label present, lock label absent;
//! - **claimed**: intent label removed, lock label added;
//! - **done**: handler returned or its error became a failure comment, and the
//!   lock label is gone again.
//!
//! A handler error never escapes [`Daemon::poll_once`]; only the candidate
//! fetch can fail a cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use crate::actions::ActionRegistry;
use crate::core::labels::intent_worklist;
use crate::core::types::Issue;
use crate::io::agent::AgentExecutor;
use crate::io::comments;
use crate::io::config::LabelConfig;
use crate::io::repo::RepoHost;
use crate::io::tracker::Tracker;

/// Granularity at which the inter-cycle sleep checks for a stop request.
const SLEEP_TICK: Duration = Duration::from_secs(1);

/// Shared stop signal, flipped by the signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Issues returned by the candidate query.
    pub candidates: usize,
    /// Labels whose handler returned successfully.
    pub processed: usize,
    /// Labels that ended with a failure comment.
    pub failed: usize,
}

/// An issue from the candidate query with its ordered intent labels.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub issue: Issue,
    pub worklist: Vec<String>,
}

pub struct Daemon<T: Tracker, R: RepoHost> {
    tracker: T,
    repo: R,
    registry: ActionRegistry,
    agent: AgentExecutor,
    intent_labels: Vec<String>,
    lock_label: String,
    poll_interval: Duration,
}

impl<T: Tracker, R: RepoHost> Daemon<T, R> {
    pub fn new(
        tracker: T,
        repo: R,
        registry: ActionRegistry,
        agent: AgentExecutor,
        labels: &LabelConfig,
        poll_interval: Duration,
    ) -> Self {
        for label in &labels.intent {
            if !registry.has_action(label) {
                warn!(label = %label, "no handler registered; label will be left in place");
            }
        }
        Self {
            tracker,
            repo,
            registry,
            agent,
            intent_labels: labels.intent.clone(),
            lock_label: labels.lock.clone(),
            poll_interval,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Fetch unlocked issues carrying intent labels, each with its worklist.
    pub fn candidates(&self) -> Result<Vec<Candidate>> {
        let issues = self
            .tracker
            .search_candidates(&self.intent_labels, &self.lock_label)?;
        Ok(issues
            .into_iter()
            .filter(|issue| {
                let locked = issue.has_label(&self.lock_label);
                if locked {
                    debug!(issue = %issue.key, "skipping locked issue");
                }
                !locked
            })
            .map(|issue| Candidate {
                worklist: intent_worklist(&issue, &self.intent_labels),
                issue,
            })
            .collect())
    }

    /// Run one cycle over every candidate. Fails only if the fetch fails.
    #[instrument(skip_all)]
    pub fn poll_once(&self) -> Result<CycleReport> {
        let candidates = self.candidates()?;
        info!(count = candidates.len(), "fetched candidates");
        let mut report = CycleReport {
            candidates: candidates.len(),
            ..CycleReport::default()
        };
        for candidate in &candidates {
            for label in &candidate.worklist {
                match self.process_label(&candidate.issue, label) {
                    Some(true) => report.processed += 1,
                    Some(false) => report.failed += 1,
                    None => {}
                }
            }
        }
        Ok(report)
    }

    /// Claim, dispatch and release one label. `None` when nothing ran.
    ///
    /// A label without a registered handler is skipped before the claim and
    /// stays on the issue.
    #[instrument(skip_all, fields(issue = %issue.key, label = %label))]
    fn process_label(&self, issue: &Issue, label: &str) -> Option<bool> {
        let Some(handler) = self.registry.get_action(label) else {
            info!("no handler registered; leaving label in place");
            return None;
        };

        if let Err(err) = self.tracker.remove_label(&issue.key, label) {
            error!(error = %format!("{err:#}"), "claim failed; skipping label");
            return None;
        }

        let outcome = self
            .tracker
            .add_label(&issue.key, &self.lock_label)
            .and_then(|()| {
                info!(action = handler.action(), "processing");
                handler.execute(issue, &self.tracker, &self.repo, &self.agent)
            });

        let succeeded = match outcome {
            Ok(summary) => {
                info!(%summary, "completed");
                true
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "action failed");
                self.report_failure(issue, label, &message);
                false
            }
        };

        if let Err(err) = self.tracker.remove_label(&issue.key, &self.lock_label) {
            error!(error = %format!("{err:#}"), "failed to release lock label");
        }
        Some(succeeded)
    }

    fn report_failure(&self, issue: &Issue, label: &str, message: &str) {
        let posted = comments::action_failed(label, message)
            .and_then(|body| self.tracker.add_comment(&issue.key, &body));
        if let Err(err) = posted {
            error!(error = %format!("{err:#}"), "failed to post failure comment");
        }
    }

    /// Poll until `stop` is set. A started cycle always runs to completion.
    pub fn run(&self, stop: &StopFlag) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            actions = ?self.registry.labels(),
            "starting daemon"
        );
        while !stop.is_stopped() {
            match self.poll_once() {
                Ok(report) if report.processed + report.failed > 0 => {
                    info!(
                        processed = report.processed,
                        failed = report.failed,
                        "cycle finished"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(error = %format!("{err:#}"), "poll cycle failed"),
            }
            sleep_unless_stopped(self.poll_interval, stop);
        }
        info!("daemon stopped");
    }
}

/// Sleep for `total`, returning early once `stop` is set.
fn sleep_unless_stopped(total: Duration, stop: &StopFlag) {
    let deadline = Instant::now() + total;
    while !stop.is_stopped() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_TICK.min(deadline - now));
    }
}
