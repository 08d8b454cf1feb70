//! Issue tracker collaborator: the [`Tracker`] contract and its Jira Cloud adapter.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use crate::core::types::{Comment, Issue};
use crate::io::oauth::{Clock, OAuthTokenManager, TokenTransport, truncate_for_error};

/// Operations the orchestrator needs from the issue tracker.
///
/// Each label mutation is a single call so a label change is never half-applied.
pub trait Tracker {
    /// Issues in the project carrying any of `intent_labels` and not `lock_label`.
    fn search_candidates(&self, intent_labels: &[String], lock_label: &str) -> Result<Vec<Issue>>;
    fn add_label(&self, issue_key: &str, label: &str) -> Result<()>;
    fn remove_label(&self, issue_key: &str, label: &str) -> Result<()>;
    fn add_comment(&self, issue_key: &str, body: &str) -> Result<()>;
    /// Comments sorted newest first.
    fn comments(&self, issue_key: &str) -> Result<Vec<Comment>>;
    /// Account id the orchestrator itself posts as.
    fn account_id(&self) -> Result<String>;
}

/// Build the candidate query for `project`.
pub fn candidate_jql(project_key: &str, intent_labels: &[String], lock_label: &str) -> String {
    let labels = intent_labels
        .iter()
        .map(|label| format!("\"{label}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("project = {project_key} AND labels in ({labels}) AND labels != \"{lock_label}\"")
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    issues: Vec<JiraIssue>,
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    key: String,
    fields: JiraFields,
}

#[derive(Debug, Deserialize)]
struct JiraFields {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    issuetype: Option<JiraIssueType>,
}

#[derive(Debug, Deserialize)]
struct JiraIssueType {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommentPage {
    #[serde(default)]
    comments: Vec<JiraComment>,
}

#[derive(Debug, Deserialize)]
struct JiraComment {
    #[serde(default)]
    body: String,
    author: Option<JiraUser>,
    created: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraUser {
    account_id: String,
}

impl From<JiraIssue> for Issue {
    fn from(raw: JiraIssue) -> Self {
        Issue {
            key: raw.key,
            issue_type: raw
                .fields
                .issuetype
                .map(|kind| kind.name)
                .unwrap_or_default(),
            summary: raw.fields.summary,
            description: raw.fields.description.unwrap_or_default(),
            labels: raw.fields.labels.into_iter().collect::<BTreeSet<_>>(),
        }
    }
}

/// Parse Jira timestamps (`2024-01-01T10:00:00.000+0000`) and RFC 3339.
pub fn parse_jira_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .with_context(|| format!("parse jira timestamp '{raw}'"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Jira Cloud REST adapter authenticated through [`OAuthTokenManager`].
///
/// The token manager sits in a `RefCell`: the daemon drives the client from one
/// thread and refreshes are the only mutation.
pub struct JiraClient<T: TokenTransport, C: Clock> {
    http: reqwest::blocking::Client,
    oauth: RefCell<OAuthTokenManager<T, C>>,
    project_key: String,
    max_results: u32,
    account_id: RefCell<Option<String>>,
}

impl<T: TokenTransport, C: Clock> JiraClient<T, C> {
    pub fn new(
        oauth: OAuthTokenManager<T, C>,
        project_key: &str,
        max_results: u32,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create jira http client")?;
        Ok(Self {
            http,
            oauth: RefCell::new(oauth),
            project_key: project_key.to_string(),
            max_results,
            account_id: RefCell::new(None),
        })
    }

    /// Token and tenant base for the next request.
    fn session(&self) -> Result<(String, String)> {
        let mut oauth = self.oauth.borrow_mut();
        let token = oauth.token()?;
        let base = oauth.api_base()?;
        Ok((token, base))
    }

    fn send(
        &self,
        operation: &str,
        build: impl FnOnce(&reqwest::blocking::Client, &str) -> reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response> {
        let (token, base) = self.session()?;
        let response = build(&self.http, &base)
            .bearer_auth(token)
            .send()
            .with_context(|| format!("jira {operation} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "jira {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        Ok(response)
    }

    fn request_json<R: DeserializeOwned>(
        &self,
        operation: &str,
        build: impl FnOnce(&reqwest::blocking::Client, &str) -> reqwest::blocking::RequestBuilder,
    ) -> Result<R> {
        self.send(operation, build)?
            .json()
            .with_context(|| format!("failed to decode jira {operation}"))
    }

    fn update_labels(&self, operation: &str, issue_key: &str, verb: &str, label: &str) -> Result<()> {
        let mut change = serde_json::Map::new();
        change.insert(verb.to_string(), json!(label));
        let payload = json!({ "update": { "labels": [change] } });
        self.send(operation, |http, base| {
            http.put(format!("{base}/rest/api/2/issue/{issue_key}"))
                .json(&payload)
        })?;
        Ok(())
    }
}

impl<T: TokenTransport, C: Clock> Tracker for JiraClient<T, C> {
    #[instrument(skip_all)]
    fn search_candidates(&self, intent_labels: &[String], lock_label: &str) -> Result<Vec<Issue>> {
        let jql = candidate_jql(&self.project_key, intent_labels, lock_label);
        debug!(%jql, "searching candidates");
        let max_results = self.max_results.to_string();
        let page: SearchResponse = self.request_json("search", |http, base| {
            http.get(format!("{base}/rest/api/2/search")).query(&[
                ("jql", jql.as_str()),
                ("maxResults", max_results.as_str()),
                ("fields", "summary,description,labels,issuetype"),
            ])
        })?;
        Ok(page.issues.into_iter().map(Issue::from).collect())
    }

    fn add_label(&self, issue_key: &str, label: &str) -> Result<()> {
        debug!(issue = issue_key, label, "adding label");
        self.update_labels("add label", issue_key, "add", label)
    }

    fn remove_label(&self, issue_key: &str, label: &str) -> Result<()> {
        debug!(issue = issue_key, label, "removing label");
        self.update_labels("remove label", issue_key, "remove", label)
    }

    fn add_comment(&self, issue_key: &str, body: &str) -> Result<()> {
        debug!(issue = issue_key, "adding comment");
        let payload = json!({ "body": body });
        self.send("add comment", |http, base| {
            http.post(format!("{base}/rest/api/2/issue/{issue_key}/comment"))
                .json(&payload)
        })?;
        Ok(())
    }

    fn comments(&self, issue_key: &str) -> Result<Vec<Comment>> {
        let page: CommentPage = self.request_json("list comments", |http, base| {
            http.get(format!("{base}/rest/api/2/issue/{issue_key}/comment"))
                .query(&[("orderBy", "-created"), ("maxResults", "100")])
        })?;
        let mut comments = page
            .comments
            .into_iter()
            .map(|raw| {
                Ok(Comment {
                    body: raw.body,
                    author_id: raw.author.map(|user| user.account_id).unwrap_or_default(),
                    created: parse_jira_timestamp(&raw.created)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        comments.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(comments)
    }

    fn account_id(&self) -> Result<String> {
        if let Some(id) = self.account_id.borrow().as_ref() {
            return Ok(id.clone());
        }
        let me: JiraUser = self.request_json("resolve account", |http, base| {
            http.get(format!("{base}/rest/api/2/myself"))
        })?;
        *self.account_id.borrow_mut() = Some(me.account_id.clone());
        Ok(me.account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::labels::default_intent_labels;
    use crate::io::oauth::{AccessibleResource, SystemClock, TokenGrant};
    use httpmock::prelude::*;

    struct StaticTransport {
        api_root: String,
    }

    impl TokenTransport for StaticTransport {
        fn client_credentials(&self) -> Result<TokenGrant> {
            Ok(TokenGrant {
                access_token: "tok".to_string(),
                expires_in: 3600,
            })
        }

        fn accessible_resources(&self, _access_token: &str) -> Result<Vec<AccessibleResource>> {
            Ok(vec![AccessibleResource {
                id: "cloud".to_string(),
                url: self.api_root.clone(),
                name: "test".to_string(),
            }])
        }
    }

    fn client(server: &MockServer) -> JiraClient<StaticTransport, SystemClock> {
        let oauth = OAuthTokenManager::new(
            StaticTransport {
                api_root: server.base_url(),
            },
            SystemClock,
            &server.base_url(),
            Duration::from_secs(300),
        );
        JiraClient::new(oauth, "ALM", 50, Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn jql_excludes_lock_label() {
        let jql = candidate_jql(
            "ALM",
            &["ai-fix".to_string(), "ai-investigate".to_string()],
            "ai-processing",
        );
        assert_eq!(
            jql,
            r#"project = ALM AND labels in ("ai-fix", "ai-investigate") AND labels != "ai-processing""#
        );
    }

    #[test]
    fn parses_jira_and_rfc3339_timestamps() {
        let jira = parse_jira_timestamp("2024-01-01T10:00:00.000+0000").expect("jira");
        let rfc = parse_jira_timestamp("2024-01-01T10:00:00Z").expect("rfc3339");
        assert_eq!(jira, rfc);
    }

    #[test]
    fn search_maps_issue_fields() {
        let server = MockServer::start();
        let search = server.mock(|when, then| {
            when.method(GET)
                .path("/ex/jira/cloud/rest/api/2/search")
                .header("authorization", "Bearer tok")
                .query_param("maxResults", "50");
            then.status(200).json_body(serde_json::json!({
                "issues": [{
                    "key": "ALM-7",
                    "fields": {
                        "summary": "Checkout fails",
                        "description": null,
                        "labels": ["ai-fix", "backend"],
                        "issuetype": {"name": "Bug"}
                    }
                }]
            }));
        });

        let issues = client(&server)
            .search_candidates(&default_intent_labels(), "ai-processing")
            .expect("search");
        search.assert_calls(1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].key, "ALM-7");
        assert_eq!(issues[0].issue_type, "Bug");
        assert_eq!(issues[0].description, "");
        assert!(issues[0].has_label("ai-fix"));
    }

    #[test]
    fn label_mutations_are_single_updates() {
        let server = MockServer::start();
        let add = server.mock(|when, then| {
            when.method(PUT)
                .path("/ex/jira/cloud/rest/api/2/issue/ALM-7")
                .json_body(serde_json::json!({"update": {"labels": [{"add": "ai-processing"}]}}));
            then.status(204);
        });
        let remove = server.mock(|when, then| {
            when.method(PUT)
                .path("/ex/jira/cloud/rest/api/2/issue/ALM-7")
                .json_body(serde_json::json!({"update": {"labels": [{"remove": "ai-fix"}]}}));
            then.status(204);
        });

        let jira = client(&server);
        jira.remove_label("ALM-7", "ai-fix").expect("remove");
        jira.add_label("ALM-7", "ai-processing").expect("add");
        add.assert_calls(1);
        remove.assert_calls(1);
    }

    #[test]
    fn comments_sorted_newest_first() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/ex/jira/cloud/rest/api/2/issue/ALM-7/comment");
            then.status(200).json_body(serde_json::json!({
                "comments": [
                    {"body": "old", "author": {"accountId": "u1"}, "created": "2024-01-01T10:00:00.000+0000"},
                    {"body": "new", "author": {"accountId": "bot"}, "created": "2024-01-02T10:00:00.000+0000"}
                ]
            }));
        });

        let comments = client(&server).comments("ALM-7").expect("comments");
        assert_eq!(comments[0].body, "new");
        assert_eq!(comments[0].author_id, "bot");
        assert_eq!(comments[1].body, "old");
    }

    #[test]
    fn account_id_is_cached() {
        let server = MockServer::start();
        let myself = server.mock(|when, then| {
            when.method(GET).path("/ex/jira/cloud/rest/api/2/myself");
            then.status(200)
                .json_body(serde_json::json!({"accountId": "bot-1", "displayName": "Bot"}));
        });

        let jira = client(&server);
        assert_eq!(jira.account_id().expect("id"), "bot-1");
        assert_eq!(jira.account_id().expect("id"), "bot-1");
        myself.assert_calls(1);
    }

    #[test]
    fn error_status_is_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/ex/jira/cloud/rest/api/2/issue/ALM-7/comment");
            then.status(403).body("forbidden");
        });

        let err = client(&server).add_comment("ALM-7", "hi").unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
