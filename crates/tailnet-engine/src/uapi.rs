//! WireGuard cross-platform UAPI client.
//!
//! The userspace device exposes a configuration socket at
//! `/var/run/wireguard/<ifname>.sock` speaking the standard text protocol:
//! a `set=1` block of `key=value` lines terminated by a blank line, answered
//! with `errno=<n>`.

use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{EngineError, Result};

const SOCK_DIR: &str = "/var/run/wireguard";

/// One peer entry in a device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    /// Peer public key, lowercase hex.
    pub public_key: String,
    /// `host:port` of the peer's current endpoint, when known.
    pub endpoint: Option<String>,
    /// CIDRs routed to this peer.
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

/// Full device configuration pushed on login and on netmap changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    /// Device private key, lowercase hex.
    pub private_key: String,
    /// 0 selects an ephemeral port.
    pub listen_port: u16,
    pub replace_peers: bool,
    pub peers: Vec<WgPeer>,
}

#[derive(Debug, Clone)]
pub struct UapiClient {
    socket: PathBuf,
}

impl UapiClient {
    pub fn for_interface(ifname: &str) -> Self {
        Self::for_socket_path(PathBuf::from(SOCK_DIR).join(format!("{ifname}.sock")))
    }

    /// Client for a device socket at an explicit path.
    pub fn for_socket_path(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket
    }

    /// Apply a configuration to the device.
    pub async fn apply(&self, cfg: &WgConfig) -> Result<()> {
        let request = render_set(cfg);
        let response = self.roundtrip(&request).await?;
        parse_errno(&response)
    }

    /// Fetch the device's current configuration dump (`get=1`).
    pub async fn dump(&self) -> Result<String> {
        let response = self.roundtrip("get=1\n\n").await?;
        parse_errno(&response)?;
        Ok(response)
    }

    async fn roundtrip(&self, request: &str) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| EngineError::Uapi(format!("connect {}: {e}", self.socket.display())))?;
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| EngineError::Uapi(format!("write: {e}")))?;

        let mut response = String::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::Uapi(format!("read: {e}")))?;
            if n == 0 {
                break;
            }
            response.push_str(&String::from_utf8_lossy(&buf[..n]));
            if response.ends_with("\n\n") {
                break;
            }
        }
        Ok(response)
    }
}

fn render_set(cfg: &WgConfig) -> String {
    let mut out = String::from("set=1\n");
    out.push_str(&format!("private_key={}\n", cfg.private_key));
    out.push_str(&format!("listen_port={}\n", cfg.listen_port));
    if cfg.replace_peers {
        out.push_str("replace_peers=true\n");
    }
    for peer in &cfg.peers {
        out.push_str(&format!("public_key={}\n", peer.public_key));
        out.push_str("replace_allowed_ips=true\n");
        if let Some(endpoint) = &peer.endpoint {
            out.push_str(&format!("endpoint={endpoint}\n"));
        }
        for cidr in &peer.allowed_ips {
            out.push_str(&format!("allowed_ip={cidr}\n"));
        }
        if let Some(secs) = peer.persistent_keepalive {
            out.push_str(&format!("persistent_keepalive_interval={secs}\n"));
        }
    }
    out.push('\n');
    out
}

fn parse_errno(response: &str) -> Result<()> {
    for line in response.lines() {
        if let Some(code) = line.strip_prefix("errno=") {
            return match code.trim().parse::<i32>() {
                Ok(0) => Ok(()),
                Ok(n) => Err(EngineError::Uapi(format!("device returned errno {n}"))),
                Err(_) => Err(EngineError::Uapi(format!("unparseable errno {code:?}"))),
            };
        }
    }
    Err(EngineError::Uapi("response missing errno".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> WgConfig {
        WgConfig {
            private_key: "00ab".into(),
            listen_port: 0,
            replace_peers: true,
            peers: vec![WgPeer {
                public_key: "11cd".into(),
                endpoint: Some("203.0.113.4:41641".into()),
                allowed_ips: vec!["100.64.0.5/32".into()],
                persistent_keepalive: Some(25),
            }],
        }
    }

    #[test]
    fn render_set_emits_expected_lines() {
        let text = render_set(&sample_config());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "set=1");
        assert!(lines.contains(&"private_key=00ab"));
        assert!(lines.contains(&"listen_port=0"));
        assert!(lines.contains(&"replace_peers=true"));
        assert!(lines.contains(&"public_key=11cd"));
        assert!(lines.contains(&"endpoint=203.0.113.4:41641"));
        assert!(lines.contains(&"allowed_ip=100.64.0.5/32"));
        assert!(lines.contains(&"persistent_keepalive_interval=25"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn render_set_without_endpoint() {
        let mut cfg = sample_config();
        cfg.peers[0].endpoint = None;
        cfg.peers[0].persistent_keepalive = None;
        let text = render_set(&cfg);
        assert!(!text.contains("endpoint="));
        assert!(!text.contains("persistent_keepalive_interval="));
    }

    #[test]
    fn errno_zero_is_ok() {
        parse_errno("errno=0\n\n").unwrap();
    }

    #[test]
    fn errno_nonzero_is_error() {
        let err = parse_errno("errno=22\n\n").unwrap_err();
        assert!(matches!(err, EngineError::Uapi(ref m) if m.contains("22")));
    }

    #[test]
    fn missing_errno_is_error() {
        assert!(parse_errno("public_key=aa\n\n").is_err());
    }
}
