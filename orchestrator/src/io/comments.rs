//! Rendering of tracker comments and pull request bodies.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};

const SECTION_TEMPLATE: &str = include_str!("comments/section.md");
const ACTION_FAILED_TEMPLATE: &str = include_str!("comments/action_failed.md");
const PULL_REQUEST_TEMPLATE: &str = include_str!("comments/pull_request.md");

static ENGINE: LazyLock<CommentEngine> = LazyLock::new(CommentEngine::new);

/// Template engine wrapper around minijinja.
struct CommentEngine {
    env: Environment<'static>,
}

impl CommentEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("section", SECTION_TEMPLATE)
            .expect("section template should be valid");
        env.add_template("action_failed", ACTION_FAILED_TEMPLATE)
            .expect("action_failed template should be valid");
        env.add_template("pull_request", PULL_REQUEST_TEMPLATE)
            .expect("pull_request template should be valid");
        Self { env }
    }
}

/// Fields of a pull request description.
#[derive(Debug, Clone)]
pub struct PullRequestBody<'a> {
    /// "Fixes" or "Implements".
    pub verb: &'a str,
    pub issue_key: &'a str,
    pub summary: &'a str,
    /// Included under its own heading when non-empty.
    pub description: Option<&'a str>,
    pub content_heading: &'a str,
    pub content: &'a str,
}

fn underline(header: &str) -> String {
    "=".repeat(header.chars().count())
}

/// Headed comment: `HEADER`, an `=` underline, optional body and cost footer.
pub fn section(header: &str, body: &str, cost_usd: Option<f64>) -> Result<String> {
    let template = ENGINE.env.get_template("section")?;
    let rendered = template.render(context! {
        header => header,
        underline => underline(header),
        body => (!body.trim().is_empty()).then(|| body.trim()),
        cost => cost_usd.map(|cost| format!("{cost:.4}")),
    })?;
    Ok(rendered)
}

/// Comment appended to an issue when a handler fails.
pub fn action_failed(label: &str, error: &str) -> Result<String> {
    let template = ENGINE.env.get_template("action_failed")?;
    Ok(template.render(context! { label => label, error => error })?)
}

pub fn pull_request_body(body: &PullRequestBody<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("pull_request")?;
    let rendered = template.render(context! {
        verb => body.verb,
        issue_key => body.issue_key,
        summary => body.summary,
        description => body.description.map(str::trim).filter(|s| !s.is_empty()),
        content_heading => body.content_heading,
        content => body.content.trim(),
    })?;
    Ok(rendered)
}

/// Body of a comment written by [`section`] under `header`, without the
/// header block and cost footer. `None` if the comment has another header.
pub fn section_body(comment: &str, header: &str) -> Option<String> {
    let rest = comment.strip_prefix(header)?;
    let rest = rest.strip_prefix('\n')?;
    let rest = rest.strip_prefix(underline(header).as_str())?;
    if !(rest.is_empty() || rest.starts_with('\n')) {
        return None;
    }
    let body = match rest.rfind("\n\n---\n_Cost: $") {
        Some(index) => &rest[..index],
        None => rest,
    };
    Some(body.trim().to_string())
}
