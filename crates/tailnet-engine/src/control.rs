//! Overlay control-plane client.
//!
//! The control protocol proper is an external component; this module pins
//! down the contract the backend depends on — register a node key (optionally
//! consuming a one-shot auth key) and receive the node's overlay addresses
//! plus the WireGuard peer set — and ships an HTTP/JSON implementation of it.
//! Tests substitute their own [`ControlClient`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dialer::Dialer;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    /// Node public key, lowercase hex.
    #[serde(rename = "nodeKey")]
    pub node_key: String,
    pub hostname: String,
    /// One-shot preauthorization key; absent when re-registering a known
    /// identity after a restart.
    #[serde(rename = "authKey", skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(rename = "allowedIps", default)]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Overlay addresses assigned to this node, as CIDRs (`/32`, `/128`).
    pub addresses: Vec<String>,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn register_node(&self, req: &RegisterRequest) -> Result<RegisterResponse>;
}

/// JSON-over-HTTPS control client.
pub struct HttpControlClient {
    base_url: String,
    dialer: Arc<Dialer>,
}

impl HttpControlClient {
    pub fn new(base_url: impl Into<String>, dialer: Arc<Dialer>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dialer,
        }
    }
}

#[async_trait]
impl ControlClient for HttpControlClient {
    async fn register_node(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        let url = format!("{}/machine/register", self.base_url);
        let resp = self
            .dialer
            .client()
            .post(&url)
            .json(req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Control {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }
}
