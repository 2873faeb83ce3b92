//! Network configuration from stdin and CNI result rendering.

use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

pub const DEFAULT_DAEMON_SOCKET: &str = "/var/run/tailscale-cni/daemon.sock";

/// CNI versions this plugin understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Network configuration delivered by the runtime on stdin.
#[derive(Debug, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(rename = "daemonSocket", default)]
    pub daemon_socket: Option<String>,
    #[serde(rename = "clusterName", default)]
    pub cluster_name: Option<String>,
    #[serde(rename = "runtimeConfig", default)]
    pub runtime_config: Option<RuntimeConfig>,
    /// Result of the previous plugin in the chain, passed through verbatim.
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Workload annotations, when the runtime forwards them.
    #[serde(rename = "podAnnotations", default)]
    pub pod_annotations: HashMap<String, String>,
}

impl NetConf {
    pub fn load(mut input: impl Read) -> Result<Self, PluginError> {
        let mut raw = String::new();
        input
            .read_to_string(&mut raw)
            .map_err(|e| PluginError::Config(format!("reading stdin: {e}")))?;
        let conf: NetConf = serde_json::from_str(&raw)
            .map_err(|e| PluginError::Config(format!("failed to parse network config: {e}")))?;
        Ok(conf)
    }

    pub fn daemon_socket(&self) -> &str {
        self.daemon_socket
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_DAEMON_SOCKET)
    }

    pub fn annotations(&self) -> HashMap<String, String> {
        self.runtime_config
            .as_ref()
            .map(|rc| rc.pod_annotations.clone())
            .unwrap_or_default()
    }

    /// First IP assigned by the previous plugin in the chain (the cluster
    /// address), without its prefix.
    pub fn cluster_ip(&self) -> String {
        let Some(prev) = &self.prev_result else {
            return String::new();
        };
        prev.get("ips")
            .and_then(Value::as_array)
            .and_then(|ips| ips.first())
            .and_then(|ip| ip.get("address"))
            .and_then(Value::as_str)
            .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
            .unwrap_or_default()
    }
}

pub fn version_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

// ---------------------------------------------------------------------------
// Result rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub interfaces: Vec<CniInterface>,
    pub ips: Vec<CniIp>,
    pub routes: Vec<CniRoute>,
}

#[derive(Debug, Serialize)]
pub struct CniInterface {
    pub name: String,
    pub sandbox: String,
}

#[derive(Debug, Serialize)]
pub struct CniIp {
    pub address: String,
    pub interface: usize,
}

#[derive(Debug, Serialize)]
pub struct CniRoute {
    pub dst: String,
}

/// Build the ADD result: one interface, the overlay addresses, and the
/// overlay range route.
pub fn build_result(
    cni_version: &str,
    ifname: &str,
    netns: &str,
    ipv4: &str,
    ipv6: &str,
) -> CniResult {
    let mut ips = vec![CniIp {
        address: format!("{ipv4}/32"),
        interface: 0,
    }];
    if !ipv6.is_empty() {
        ips.push(CniIp {
            address: format!("{ipv6}/128"),
            interface: 0,
        });
    }
    CniResult {
        cni_version: cni_version.to_string(),
        interfaces: vec![CniInterface {
            name: ifname.to_string(),
            sandbox: netns.to_string(),
        }],
        ips,
        routes: vec![CniRoute {
            dst: "100.64.0.0/10".to_string(),
        }],
    }
}

/// Error object in the runtime's expected shape.
#[derive(Debug, Serialize)]
pub struct CniErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_gets_default_socket() {
        let conf = NetConf::load(
            r#"{"cniVersion": "1.0.0", "name": "tailnet", "type": "tailnet-cni"}"#.as_bytes(),
        )
        .unwrap();
        assert_eq!(conf.daemon_socket(), DEFAULT_DAEMON_SOCKET);
        assert_eq!(conf.cni_version, "1.0.0");
        assert_eq!(conf.name, "tailnet");
        assert_eq!(conf.plugin_type, "tailnet-cni");
    }

    #[test]
    fn custom_socket_is_respected() {
        let conf = NetConf::load(
            r#"{"cniVersion": "1.0.0", "name": "t", "type": "t",
                "daemonSocket": "/custom/path/daemon.sock"}"#
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(conf.daemon_socket(), "/custom/path/daemon.sock");
    }

    #[test]
    fn cluster_name_is_parsed() {
        let conf = NetConf::load(
            r#"{"cniVersion": "1.0.0", "name": "t", "type": "t",
                "clusterName": "production"}"#
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(conf.cluster_name.as_deref(), Some("production"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(NetConf::load(r#"{invalid json}"#.as_bytes()).is_err());
    }

    #[test]
    fn empty_config_is_valid() {
        let conf = NetConf::load(r#"{}"#.as_bytes()).unwrap();
        assert_eq!(conf.daemon_socket(), DEFAULT_DAEMON_SOCKET);
        assert!(conf.cni_version.is_empty());
    }

    #[test]
    fn cluster_ip_from_prev_result() {
        let conf = NetConf::load(
            serde_json::to_string(&json!({
                "cniVersion": "1.0.0",
                "name": "t",
                "type": "t",
                "prevResult": {
                    "ips": [
                        {"address": "10.244.0.17/24"},
                        {"address": "10.244.0.18/24"},
                    ],
                },
            }))
            .unwrap()
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(conf.cluster_ip(), "10.244.0.17");
    }

    #[test]
    fn cluster_ip_without_prev_result_is_empty() {
        let conf = NetConf::load(r#"{"cniVersion": "1.0.0"}"#.as_bytes()).unwrap();
        assert_eq!(conf.cluster_ip(), "");
    }

    #[test]
    fn supported_versions() {
        assert!(version_supported("1.0.0"));
        assert!(version_supported("0.4.0"));
        assert!(!version_supported("2.0.0"));
    }

    #[test]
    fn result_includes_overlay_route_and_addresses() {
        let result = build_result(
            "1.0.0",
            "ts0",
            "/proc/1234/ns/net",
            "100.64.0.7",
            "fd7a:115c:a1e0::7",
        );
        let rendered = serde_json::to_value(&result).unwrap();
        assert_eq!(rendered["cniVersion"], "1.0.0");
        assert_eq!(rendered["interfaces"][0]["name"], "ts0");
        assert_eq!(rendered["ips"][0]["address"], "100.64.0.7/32");
        assert_eq!(rendered["ips"][1]["address"], "fd7a:115c:a1e0::7/128");
        assert_eq!(rendered["routes"][0]["dst"], "100.64.0.0/10");
    }

    #[test]
    fn result_without_ipv6_has_one_address() {
        let result = build_result("1.0.0", "ts0", "/proc/1/ns/net", "100.64.0.7", "");
        assert_eq!(result.ips.len(), 1);
    }
}
