//! OAuth client-credentials token lifecycle for the tracker API.
//!
//! [`OAuthTokenManager`] caches one bearer token together with the tenant API
//! base resolved for it. A token is refreshed once `now >= expires_at - buffer`;
//! refreshing drops the cached tenant base, which is re-resolved lazily on the
//! next [`OAuthTokenManager::api_base`] call. The manager has a single owner and
//! is driven from one thread, so it takes `&mut self` and holds no locks.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Response of a client-credentials grant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// One tenant returned by resource discovery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessibleResource {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
}

/// The two OAuth endpoints the manager depends on.
pub trait TokenTransport {
    fn client_credentials(&self) -> Result<TokenGrant>;
    fn accessible_resources(&self, access_token: &str) -> Result<Vec<AccessibleResource>>;
}

/// Cached token state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Tenant API base resolved with this token, if any.
    pub tenant_base: Option<String>,
}

/// Obtains, caches and refreshes the tracker bearer token.
pub struct OAuthTokenManager<T: TokenTransport, C: Clock> {
    transport: T,
    clock: C,
    api_root: String,
    buffer: TimeDelta,
    token: Option<OAuthToken>,
}

impl<T: TokenTransport, C: Clock> OAuthTokenManager<T, C> {
    pub fn new(transport: T, clock: C, api_root: &str, expiry_buffer: Duration) -> Self {
        Self {
            transport,
            clock,
            api_root: api_root.trim_end_matches('/').to_string(),
            buffer: TimeDelta::from_std(expiry_buffer).unwrap_or(TimeDelta::MAX),
            token: None,
        }
    }

    /// Return a bearer token that is valid beyond the expiry buffer.
    pub fn token(&mut self) -> Result<String> {
        self.ensure_fresh()?;
        self.token
            .as_ref()
            .map(|token| token.access_token.clone())
            .ok_or_else(|| anyhow!("oauth token missing after refresh"))
    }

    /// Return the tenant-scoped API base (`{api_root}/ex/jira/{tenant}`).
    ///
    /// Resolved at most once per token; the first accessible tenant wins.
    pub fn api_base(&mut self) -> Result<String> {
        self.ensure_fresh()?;
        let token = self
            .token
            .as_mut()
            .ok_or_else(|| anyhow!("oauth token missing after refresh"))?;
        if let Some(base) = &token.tenant_base {
            return Ok(base.clone());
        }
        let resources = self
            .transport
            .accessible_resources(&token.access_token)
            .context("discover accessible tenants")?;
        let tenant = resources
            .first()
            .ok_or_else(|| anyhow!("oauth client has no accessible tenants"))?;
        let base = format!("{}/ex/jira/{}", self.api_root, tenant.id);
        info!(tenant = %tenant.name, base = %base, "resolved tenant api base");
        token.tenant_base = Some(base.clone());
        Ok(base)
    }

    /// Cached token state, for diagnostics.
    pub fn cached(&self) -> Option<&OAuthToken> {
        self.token.as_ref()
    }

    fn ensure_fresh(&mut self) -> Result<()> {
        let now = self.clock.now();
        let fresh = self.token.as_ref().is_some_and(|token| {
            token
                .expires_at
                .checked_sub_signed(self.buffer)
                .is_some_and(|refresh_at| now < refresh_at)
        });
        if !fresh {
            self.token = Some(self.refresh(now)?);
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn refresh(&self, now: DateTime<Utc>) -> Result<OAuthToken> {
        debug!("requesting oauth token");
        let grant = self
            .transport
            .client_credentials()
            .context("oauth client-credentials grant")?;
        let lifetime = i64::try_from(grant.expires_in)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| anyhow!("oauth expires_in out of range: {}", grant.expires_in))?;
        let expires_at = now + lifetime;
        info!(%expires_at, "obtained oauth token");
        Ok(OAuthToken {
            access_token: grant.access_token,
            expires_at,
            tenant_base: None,
        })
    }
}

/// [`TokenTransport`] over HTTPS.
pub struct HttpTokenTransport {
    http: reqwest::blocking::Client,
    token_url: String,
    resources_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenTransport {
    pub fn new(
        token_url: &str,
        resources_url: &str,
        client_id: &str,
        client_secret: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create oauth http client")?;
        Ok(Self {
            http,
            token_url: token_url.to_string(),
            resources_url: resources_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

impl TokenTransport for HttpTokenTransport {
    fn client_credentials(&self) -> Result<TokenGrant> {
        let payload = json!({
            "grant_type": "client_credentials",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        });
        let response = self
            .http
            .post(&self.token_url)
            .json(&payload)
            .send()
            .context("oauth token request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "oauth token request failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 400)
            );
        }
        response.json().context("failed to decode oauth token response")
    }

    fn accessible_resources(&self, access_token: &str) -> Result<Vec<AccessibleResource>> {
        let response = self
            .http
            .get(&self.resources_url)
            .bearer_auth(access_token)
            .send()
            .context("oauth resource discovery request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "oauth resource discovery failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 400)
            );
        }
        response
            .json()
            .context("failed to decode accessible resources")
    }
}

/// Cut `body` to at most `max_chars` characters for error messages.
pub(crate) fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut out: String = body.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone)]
    struct ManualClock(Rc<Cell<DateTime<Utc>>>);

    impl ManualClock {
        fn at(start: DateTime<Utc>) -> Self {
            Self(Rc::new(Cell::new(start)))
        }

        fn advance(&self, secs: i64) {
            self.0.set(self.0.get() + TimeDelta::seconds(secs));
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        grants: Cell<u32>,
        discoveries: Cell<u32>,
        tenants: RefCell<Vec<AccessibleResource>>,
    }

    impl CountingTransport {
        fn with_tenants(ids: &[&str]) -> Self {
            let transport = Self::default();
            *transport.tenants.borrow_mut() = ids
                .iter()
                .map(|id| AccessibleResource {
                    id: id.to_string(),
                    url: format!("https://{id}.example.net"),
                    name: id.to_string(),
                })
                .collect();
            transport
        }
    }

    impl TokenTransport for Rc<CountingTransport> {
        fn client_credentials(&self) -> Result<TokenGrant> {
            self.grants.set(self.grants.get() + 1);
            Ok(TokenGrant {
                access_token: format!("token-{}", self.grants.get()),
                expires_in: 3600,
            })
        }

        fn accessible_resources(&self, access_token: &str) -> Result<Vec<AccessibleResource>> {
            assert!(access_token.starts_with("token-"));
            self.discoveries.set(self.discoveries.get() + 1);
            Ok(self.tenants.borrow().clone())
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn manager(
        transport: &Rc<CountingTransport>,
        clock: &ManualClock,
    ) -> OAuthTokenManager<Rc<CountingTransport>, ManualClock> {
        OAuthTokenManager::new(
            Rc::clone(transport),
            clock.clone(),
            "https://api.example.net/",
            Duration::from_secs(300),
        )
    }

    #[test]
    fn reuses_token_before_buffer() {
        let transport = Rc::new(CountingTransport::with_tenants(&["cloud-1"]));
        let clock = ManualClock::at(start());
        let mut oauth = manager(&transport, &clock);

        assert_eq!(oauth.token().expect("token"), "token-1");
        clock.advance(3600 - 301);
        assert_eq!(oauth.token().expect("token"), "token-1");
        assert_eq!(transport.grants.get(), 1);
    }

    #[test]
    fn refreshes_exactly_once_at_buffer() {
        let transport = Rc::new(CountingTransport::with_tenants(&["cloud-1"]));
        let clock = ManualClock::at(start());
        let mut oauth = manager(&transport, &clock);

        oauth.token().expect("token");
        clock.advance(3600 - 300);
        assert_eq!(oauth.token().expect("token"), "token-2");
        assert_eq!(oauth.token().expect("token"), "token-2");
        assert_eq!(transport.grants.get(), 2);
    }

    #[test]
    fn api_base_resolved_once_per_token() {
        let transport = Rc::new(CountingTransport::with_tenants(&["cloud-1", "cloud-2"]));
        let clock = ManualClock::at(start());
        let mut oauth = manager(&transport, &clock);

        let base = oauth.api_base().expect("base");
        assert_eq!(base, "https://api.example.net/ex/jira/cloud-1");
        oauth.api_base().expect("base");
        oauth.token().expect("token");
        assert_eq!(transport.discoveries.get(), 1);

        clock.advance(3600);
        oauth.token().expect("token");
        assert_eq!(oauth.cached().expect("cached").tenant_base, None);
        oauth.api_base().expect("base");
        assert_eq!(transport.discoveries.get(), 2);
        assert_eq!(transport.grants.get(), 2);
    }

    #[test]
    fn no_tenants_is_an_error() {
        let transport = Rc::new(CountingTransport::with_tenants(&[]));
        let clock = ManualClock::at(start());
        let mut oauth = manager(&transport, &clock);

        let err = oauth.api_base().unwrap_err();
        assert!(err.to_string().contains("no accessible tenants"));
    }

    #[test]
    fn http_transport_grant_and_discovery() {
        let server = MockServer::start();
        let grant = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .json_body_includes(
                    serde_json::json!({
                        "grant_type": "client_credentials",
                        "client_id": "cid",
                    })
                    .to_string(),
                );
            then.status(200)
                .json_body(serde_json::json!({"access_token": "abc", "expires_in": 3600}));
        });
        let discovery = server.mock(|when, then| {
            when.method(GET)
                .path("/oauth/token/accessible-resources")
                .header("authorization", "Bearer abc");
            then.status(200).json_body(serde_json::json!([
                {"id": "tenant-9", "url": "https://acme.atlassian.net", "name": "acme"}
            ]));
        });

        let transport = HttpTokenTransport::new(
            &server.url("/oauth/token"),
            &server.url("/oauth/token/accessible-resources"),
            "cid",
            "secret",
            Duration::from_secs(5),
        )
        .expect("transport");
        let mut oauth = OAuthTokenManager::new(
            transport,
            SystemClock,
            &server.base_url(),
            Duration::from_secs(300),
        );

        assert_eq!(oauth.token().expect("token"), "abc");
        assert_eq!(
            oauth.api_base().expect("base"),
            format!("{}/ex/jira/tenant-9", server.base_url())
        );
        grant.assert_calls(1);
        discovery.assert_calls(1);
    }

    #[test]
    fn http_transport_surfaces_auth_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(401).body("invalid_client");
        });
        let transport = HttpTokenTransport::new(
            &server.url("/oauth/token"),
            &server.url("/resources"),
            "cid",
            "bad",
            Duration::from_secs(5),
        )
        .expect("transport");

        let err = transport.client_credentials().unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
