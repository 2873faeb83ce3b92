//! CNI plugin shim.
//!
//! The runtime executes this binary once per operation with the command in
//! `CNI_COMMAND`, identity in `CNI_*` variables, and the network config on
//! stdin. All real work happens in the daemon; this shim parses, forwards
//! over the Unix socket, and renders the result JSON on stdout. Logs go to
//! stderr — stdout belongs to the runtime.

mod args;
mod config;
mod error;
mod workload;

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use cni_client::DaemonClient;
use cni_proto::{AddRequest, PodRef};

use crate::args::K8sArgs;
use crate::config::NetConf;
use crate::error::PluginError;
use crate::workload::WorkloadConfig;

const ADD_DEADLINE: Duration = Duration::from_secs(120);
const DEL_DEADLINE: Duration = Duration::from_secs(30);
const CHECK_DEADLINE: Duration = Duration::from_secs(10);

struct Invocation {
    container_id: String,
    netns: String,
    ifname: String,
    cni_args: String,
}

impl Invocation {
    fn from_env() -> Result<Self, PluginError> {
        Ok(Self {
            container_id: require_env("CNI_CONTAINERID")?,
            netns: std::env::var("CNI_NETNS").unwrap_or_default(),
            ifname: require_env("CNI_IFNAME")?,
            cni_args: std::env::var("CNI_ARGS").unwrap_or_default(),
        })
    }
}

fn require_env(name: &'static str) -> Result<String, PluginError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(PluginError::MissingEnv(name)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let command = std::env::var("CNI_COMMAND").unwrap_or_default();

    let outcome = match command.as_str() {
        "ADD" => cmd_add().await,
        "DEL" => cmd_del().await,
        "CHECK" => cmd_check().await,
        "VERSION" => cmd_version(),
        other => Err(PluginError::Config(format!(
            "unknown CNI_COMMAND {other:?}"
        ))),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = config::CniErrorResult {
                cni_version: "1.0.0".into(),
                code: e.code(),
                msg: e.to_string(),
            };
            if let Ok(rendered) = serde_json::to_string(&error) {
                println!("{rendered}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn cmd_add() -> Result<(), PluginError> {
    let conf = NetConf::load(std::io::stdin())?;
    if !conf.cni_version.is_empty() && !config::version_supported(&conf.cni_version) {
        return Err(PluginError::Version(conf.cni_version));
    }
    let invocation = Invocation::from_env()?;
    let k8s = K8sArgs::parse(&invocation.cni_args)?;
    debug!(
        network = %conf.name,
        plugin = %conf.plugin_type,
        cluster = conf.cluster_name.as_deref().unwrap_or(""),
        pod = %k8s.pod_name,
        "ADD"
    );

    // Workloads that opted out pass through whatever the chain produced.
    let workload = WorkloadConfig::from_annotations(&conf.annotations());
    if !workload.enabled {
        let passthrough = conf
            .prev_result
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "cniVersion": conf.cni_version }));
        println!("{}", serde_json::to_string(&passthrough).unwrap_or_default());
        return Ok(());
    }
    if !workload.tags.is_empty() || !workload.hostname.is_empty() || workload.ephemeral {
        // Per-workload overrides ride along for operators reading logs; the
        // daemon applies its own tag and hostname policy.
        debug!(
            tags = ?workload.tags,
            hostname = %workload.hostname,
            ephemeral = workload.ephemeral,
            "workload annotations present"
        );
    }

    let mut client = DaemonClient::connect(Path::new(conf.daemon_socket())).await?;
    let resp = client
        .add(
            &AddRequest {
                container_id: invocation.container_id,
                netns: invocation.netns.clone(),
                ifname: invocation.ifname.clone(),
                pod_name: k8s.pod_name,
                pod_namespace: k8s.pod_namespace,
                pod_uid: k8s.pod_uid,
                cluster_ip: conf.cluster_ip(),
            },
            ADD_DEADLINE,
        )
        .await?;

    let result = config::build_result(
        &conf.cni_version,
        &invocation.ifname,
        &invocation.netns,
        &resp.ipv4,
        &resp.ipv6,
    );
    println!(
        "{}",
        serde_json::to_string(&result)
            .map_err(|e| PluginError::Config(format!("rendering result: {e}")))?
    );
    Ok(())
}

/// DEL always reports success to the runtime: the daemon being unreachable
/// means cleanup either happened or will happen on its next startup sweep.
async fn cmd_del() -> Result<(), PluginError> {
    let conf = NetConf::load(std::io::stdin())?;
    let invocation = Invocation::from_env()?;

    let mut client = match DaemonClient::connect(Path::new(conf.daemon_socket())).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "could not connect to daemon, assuming already cleaned up");
            return Ok(());
        }
    };

    if let Err(e) = client
        .delete(
            &PodRef {
                container_id: invocation.container_id,
                netns: invocation.netns,
                ifname: invocation.ifname,
            },
            DEL_DEADLINE,
        )
        .await
    {
        warn!(error = %e, "daemon delete returned error");
    }
    Ok(())
}

async fn cmd_check() -> Result<(), PluginError> {
    let conf = NetConf::load(std::io::stdin())?;
    let invocation = Invocation::from_env()?;

    let mut client = DaemonClient::connect(Path::new(conf.daemon_socket())).await?;
    let resp = client
        .check(
            &PodRef {
                container_id: invocation.container_id,
                netns: invocation.netns,
                ifname: invocation.ifname,
            },
            CHECK_DEADLINE,
        )
        .await?;

    if !resp.healthy {
        return Err(PluginError::Unhealthy(resp.message));
    }
    Ok(())
}

fn cmd_version() -> Result<(), PluginError> {
    let versions = serde_json::json!({
        "cniVersion": "1.0.0",
        "supportedVersions": config::SUPPORTED_VERSIONS,
    });
    println!("{versions}");
    Ok(())
}
