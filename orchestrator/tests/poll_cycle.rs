//! End-to-end poll cycles over the built-in actions.
//!
//! Uses the in-memory tracker and repository host with a real `sh` subprocess
//! standing in for the agent, so prompt rendering, policy installation and
//! output parsing all run for real.

use std::fs;
use std::time::Duration;

use alm_orchestrator::actions::ActionRegistry;
use alm_orchestrator::daemon::{CycleReport, Daemon};
use alm_orchestrator::io::config::LabelConfig;
use alm_orchestrator::test_support::{FakeRepoHost, FakeTracker, PromptsFixture, issue, scripted_agent};

fn daemon_with(
    prompts: &PromptsFixture,
    script: &str,
    tracker: FakeTracker,
    repo: FakeRepoHost,
) -> Daemon<FakeTracker, FakeRepoHost> {
    let registry = ActionRegistry::discover(prompts.path()).expect("discover");
    Daemon::new(
        tracker,
        repo,
        registry,
        scripted_agent(prompts.path(), script),
        &LabelConfig::default(),
        Duration::from_secs(30),
    )
}

#[test]
fn investigation_feeds_recommendation_in_same_cycle() {
    let prompts = PromptsFixture::new(&["investigate", "recommend"]);
    fs::write(
        prompts.path().join("investigate.md"),
        "investigate {issue_key}: {issue_description}",
    )
    .expect("template");
    fs::write(
        prompts.path().join("recommend.md"),
        "recommend {issue_key}\n{investigation_section}",
    )
    .expect("template");

    let mut alm = issue("ALM-1", "Bug", &["ai-recommend", "backend", "ai-investigate"]);
    alm.description = "Crash when name is {github_token}".to_string();
    let tracker = FakeTracker::new(vec![alm]);
    // The "agent" answers with the prompt it was given.
    let daemon = daemon_with(&prompts, r#"printf '%s' "$1""#, tracker, FakeRepoHost::new());

    let report = daemon.poll_once().expect("cycle");

    assert_eq!(
        report,
        CycleReport {
            candidates: 1,
            processed: 2,
            failed: 0
        }
    );
    assert_eq!(daemon.tracker().labels("ALM-1"), vec!["backend"]);

    let bodies = daemon.tracker().comment_bodies("ALM-1");
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].starts_with("INVESTIGATION RESULTS\n"));
    assert!(bodies[0].contains("investigate ALM-1: Crash when name is {github_token}"));
    assert!(bodies[1].starts_with("RECOMMENDATIONS\n"));
    assert!(bodies[1].contains("## Prior Investigation"));
    assert!(bodies[1].contains("investigate ALM-1: Crash when name is {github_token}"));

    assert_eq!(daemon.repo().checkouts().len(), 2);
    assert!(daemon.repo().checkouts().iter().all(|path| !path.exists()));
}

#[test]
fn agent_failure_becomes_failure_comment() {
    let prompts = PromptsFixture::new(&["fix"]);
    let tracker = FakeTracker::new(vec![issue("ALM-2", "Bug", &["ai-fix"])]);
    let daemon = daemon_with(
        &prompts,
        "echo 'model overloaded' >&2; exit 7",
        tracker,
        FakeRepoHost::new(),
    );

    let report = daemon.poll_once().expect("cycle");

    assert_eq!(report.failed, 1);
    assert!(daemon.tracker().labels("ALM-2").is_empty());
    let bodies = daemon.tracker().comment_bodies("ALM-2");
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].starts_with("## AI Action Failed\n\n**Label:** ai-fix\n**Error:** "));
    assert!(bodies[0].contains("exit code 7"));
    assert!(bodies[0].contains("model overloaded"));
    assert!(!daemon.repo().checkouts()[0].exists());
}

#[test]
fn missing_policy_fails_closed_without_running_agent() {
    let prompts = PromptsFixture::new(&["investigate"]);
    fs::remove_file(prompts.path().join("investigate.json")).expect("remove policy");
    let marker = prompts.path().join("agent-ran");
    let script = format!("touch '{}'", marker.display());
    let tracker = FakeTracker::new(vec![issue("ALM-3", "Task", &["ai-investigate"])]);
    let daemon = daemon_with(&prompts, &script, tracker, FakeRepoHost::new());

    let report = daemon.poll_once().expect("cycle");

    assert_eq!(report.failed, 1);
    assert!(!marker.exists());
    let bodies = daemon.tracker().comment_bodies("ALM-3");
    assert!(bodies[0].contains("policy for action 'investigate' not found"));
    assert!(daemon.tracker().labels("ALM-3").is_empty());
}

#[test]
fn one_failing_issue_does_not_stop_the_cycle() {
    let prompts = PromptsFixture::new(&["impact", "investigate"]);
    let tracker = FakeTracker::new(vec![
        issue("ALM-4", "Bug", &["ai-impact"]),
        issue("ALM-5", "Bug", &["ai-investigate"]),
    ]);
    // Fails only for the impact prompt.
    let daemon = daemon_with(
        &prompts,
        r#"case "$1" in impact*) exit 1;; *) printf '{"result":"ok","cost_usd":0.01}';; esac"#,
        tracker,
        FakeRepoHost::new(),
    );

    let report = daemon.poll_once().expect("cycle");

    assert_eq!(
        report,
        CycleReport {
            candidates: 2,
            processed: 1,
            failed: 1
        }
    );
    assert!(daemon.tracker().comment_bodies("ALM-4")[0].starts_with("## AI Action Failed"));
    assert!(daemon.tracker().comment_bodies("ALM-5")[0].starts_with("INVESTIGATION RESULTS"));
}
