//! Credential manager for the overlay control API.
//!
//! Caches the short-lived OAuth bearer token and mints one-shot,
//! preauthorized node keys. Key minting is bounded by a semaphore and a
//! minimum inter-request interval so a node booting fifty pods does not
//! stampede the API. Cancellation is cooperative: dropping the future
//! aborts any semaphore wait or rate-limit sleep.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.tailscale.com";

/// Concurrent key-mint requests allowed in flight.
const MAX_CONCURRENT_KEY_REQUESTS: usize = 5;

/// Minimum spacing between key-mint requests.
const KEY_REQUEST_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Refresh the bearer token when it is within this buffer of expiry.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// Default lifetime requested for minted keys.
pub const DEFAULT_AUTH_KEY_TTL: Duration = Duration::from_secs(300);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OauthError {
    #[error("token request failed with status {status}: {body}")]
    Token { status: u16, body: String },

    #[error("auth key request failed with status {status}: {body}")]
    Key { status: u16, body: String },

    #[error("building http client: {0}")]
    Client(reqwest::Error),

    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, OauthError>;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    expires_in: u64,
}

#[derive(Serialize)]
struct KeyRequest<'a> {
    capabilities: Capabilities<'a>,
    #[serde(rename = "expirySeconds")]
    expiry_seconds: u64,
    description: String,
}

#[derive(Serialize)]
struct Capabilities<'a> {
    devices: Devices<'a>,
}

#[derive(Serialize)]
struct Devices<'a> {
    create: CreateCaps<'a>,
}

#[derive(Serialize)]
struct CreateCaps<'a> {
    reusable: bool,
    ephemeral: bool,
    preauthorized: bool,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct KeyResponse {
    #[allow(dead_code)]
    id: Option<String>,
    key: String,
}

#[derive(Default)]
struct TokenCache {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    last_key_request: Option<Instant>,
}

pub struct OauthManager {
    client_id: String,
    client_secret: String,
    base_url: String,
    tags: Vec<String>,
    key_ttl: Duration,

    /// Covers both the token cache and the rate-limit timestamp.
    cache: Mutex<TokenCache>,
    key_semaphore: Semaphore,
    http: reqwest::Client,
}

impl OauthManager {
    /// `key_ttl` of zero falls back to [`DEFAULT_AUTH_KEY_TTL`].
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tags: Vec<String>,
        key_ttl: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(OauthError::Client)?;
        Ok(Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            tags,
            key_ttl: if key_ttl.is_zero() {
                DEFAULT_AUTH_KEY_TTL
            } else {
                key_ttl
            },
            cache: Mutex::new(TokenCache::default()),
            key_semaphore: Semaphore::new(MAX_CONCURRENT_KEY_REQUESTS),
            http,
        })
    }

    /// Point the manager at a different API base (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn key_ttl(&self) -> Duration {
        self.key_ttl
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Return a valid bearer token, refreshing when the cached one is
    /// absent or within five minutes of expiry. The cache mutex is held
    /// across the refresh so concurrent callers do one exchange.
    pub async fn bearer(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;

        if let (Some(token), Some(expires_at)) = (&cache.access_token, cache.expires_at) {
            if Instant::now() + TOKEN_EXPIRY_BUFFER < expires_at {
                return Ok(token.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/api/v2/oauth/token", self.base_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OauthError::Token {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = resp.json().await?;
        cache.access_token = Some(token.access_token.clone());
        cache.expires_at = Some(Instant::now() + Duration::from_secs(token.expires_in));
        Ok(token.access_token)
    }

    /// Mint a one-shot, preauthorized, non-ephemeral auth key for a workload.
    ///
    /// Non-ephemeral is deliberate: ephemeral nodes evaporate when the
    /// engine disconnects, which would break crash recovery.
    pub async fn mint_key(&self, workload_name: &str, workload_namespace: &str) -> Result<String> {
        let _permit = self
            .key_semaphore
            .acquire()
            .await
            .expect("key semaphore never closed");

        // Enforce the minimum spacing between requests.
        {
            let mut cache = self.cache.lock().await;
            if let Some(last) = cache.last_key_request {
                let elapsed = last.elapsed();
                if elapsed < KEY_REQUEST_MIN_INTERVAL {
                    let wait = KEY_REQUEST_MIN_INTERVAL - elapsed;
                    drop(cache);
                    debug!(wait_ms = wait.as_millis() as u64, "rate limiting auth key request");
                    tokio::time::sleep(wait).await;
                    cache = self.cache.lock().await;
                }
            }
            cache.last_key_request = Some(Instant::now());
        }

        let token = self.bearer().await?;

        let req = KeyRequest {
            capabilities: Capabilities {
                devices: Devices {
                    create: CreateCaps {
                        reusable: false,
                        ephemeral: false,
                        preauthorized: true,
                        tags: &self.tags,
                    },
                },
            },
            expiry_seconds: self.key_ttl.as_secs(),
            description: format!("tailnet-cni {workload_namespace} {workload_name}"),
        };

        let resp = self
            .http
            .post(format!("{}/api/v2/tailnet/-/keys", self.base_url))
            .bearer_auth(token)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OauthError::Key {
                status: status.as_u16(),
                body,
            });
        }

        let key: KeyResponse = resp.json().await?;
        Ok(key.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn manager_for(server: &MockServer) -> OauthManager {
        OauthManager::new(
            "client-id",
            "client-secret",
            vec!["tag:k8s-pod".into()],
            Duration::ZERO,
        )
        .unwrap()
        .with_base_url(server.base_url())
    }

    async fn mock_token(server: &MockServer, expires_in: u64) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v2/oauth/token")
                    .body_includes("client_id=client-id");
                then.status(200).json_body(json!({
                    "access_token": "t0ken",
                    "token_type": "Bearer",
                    "expires_in": expires_in,
                }));
            })
            .await
    }

    async fn mock_key(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v2/tailnet/-/keys")
                    .header("authorization", "Bearer t0ken")
                    .json_body_includes(
                        r#"{"capabilities":{"devices":{"create":{
                            "reusable":false,"ephemeral":false,"preauthorized":true,
                            "tags":["tag:k8s-pod"]}}}}"#,
                    );
                then.status(200)
                    .json_body(json!({"id": "k123", "key": "tskey-auth-xyz"}));
            })
            .await
    }

    #[test]
    fn zero_ttl_defaults_to_five_minutes() {
        let mgr =
            OauthManager::new("id", "secret", vec![], Duration::ZERO).unwrap();
        assert_eq!(mgr.key_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn custom_ttl_is_kept() {
        let mgr =
            OauthManager::new("id", "secret", vec![], Duration::from_secs(600)).unwrap();
        assert_eq!(mgr.key_ttl(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn token_is_cached_across_mints() {
        let server = MockServer::start_async().await;
        let token_mock = mock_token(&server, 3600).await;
        let key_mock = mock_key(&server).await;

        let mgr = manager_for(&server);
        mgr.mint_key("web", "default").await.unwrap();
        mgr.mint_key("web-2", "default").await.unwrap();

        token_mock.assert_calls_async(1).await;
        key_mock.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed() {
        let server = MockServer::start_async().await;
        // expires_in of 60s is inside the 5-minute refresh buffer.
        let token_mock = mock_token(&server, 60).await;

        let mgr = manager_for(&server);
        mgr.bearer().await.unwrap();
        mgr.bearer().await.unwrap();

        token_mock.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn token_failure_carries_status_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/oauth/token");
                then.status(401).body("bad credentials");
            })
            .await;

        let mgr = manager_for(&server);
        let err = mgr.bearer().await.unwrap_err();
        match err {
            OauthError::Token { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad credentials");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn key_failure_carries_status_and_body() {
        let server = MockServer::start_async().await;
        mock_token(&server, 3600).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/tailnet/-/keys");
                then.status(403).body("tags not allowed");
            })
            .await;

        let mgr = manager_for(&server);
        let err = mgr.mint_key("web", "default").await.unwrap_err();
        match err {
            OauthError::Key { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "tags not allowed");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn mint_requests_are_spaced() {
        let server = MockServer::start_async().await;
        mock_token(&server, 3600).await;
        mock_key(&server).await;

        let mgr = manager_for(&server);
        let start = std::time::Instant::now();
        mgr.mint_key("a", "ns").await.unwrap();
        mgr.mint_key("b", "ns").await.unwrap();
        mgr.mint_key("c", "ns").await.unwrap();

        // Three sequential requests imply at least two 100 ms gaps.
        assert!(
            start.elapsed() >= Duration::from_millis(200),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn concurrent_mints_all_complete() {
        let server = MockServer::start_async().await;
        mock_token(&server, 3600).await;
        let key_mock = mock_key(&server).await;

        let mgr = Arc::new(manager_for(&server));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let mgr = mgr.clone();
            tasks.push(tokio::spawn(async move {
                mgr.mint_key(&format!("pod-{i}"), "ns").await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        key_mock.assert_calls_async(8).await;
    }

    #[tokio::test]
    async fn key_request_description_names_workload() {
        let server = MockServer::start_async().await;
        mock_token(&server, 3600).await;
        let key_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v2/tailnet/-/keys")
                    .body_includes("tailnet-cni media plex");
                then.status(200).json_body(json!({"key": "tskey-auth-p"}));
            })
            .await;

        let mgr = manager_for(&server);
        mgr.mint_key("plex", "media").await.unwrap();
        key_mock.assert_calls_async(1).await;
    }
}
