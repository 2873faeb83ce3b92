use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tailnetd::netlink::Netlink;
use tailnetd::oauth::OauthManager;
use tailnetd::pods::PodManager;
use tailnetd::server::Server;
use tailnetd::state::StatePaths;

const DEFAULT_TAG: &str = "tag:k8s-pod";

#[derive(Parser)]
#[command(name = "tailnetd", version, about = "Overlay network daemon for container workloads")]
struct Cli {
    /// Path of the Unix socket served to the CNI plugin.
    #[arg(long, default_value = "/var/run/tailscale-cni/daemon.sock")]
    socket: PathBuf,

    /// Directory for per-container state.
    #[arg(long, default_value = "/var/lib/tailscale-cni")]
    state_dir: PathBuf,

    /// Cluster name used in node hostnames.
    #[arg(long, env = "CLUSTER_NAME", default_value = "k8s")]
    cluster_name: String,

    /// Comma-separated tags applied to created nodes.
    #[arg(long, env = "TS_TAGS", default_value = "")]
    tags: String,

    /// Lifetime requested for minted auth keys.
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    auth_key_ttl: Duration,

    /// Overlay control-plane URL.
    #[arg(long, env = "TS_CONTROL_URL", default_value = tailnet_engine::DEFAULT_CONTROL_URL)]
    control_url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let client_id = std::env::var("TS_OAUTH_CLIENT_ID").unwrap_or_default();
    let client_secret = std::env::var("TS_OAUTH_CLIENT_SECRET").unwrap_or_default();
    if client_id.is_empty() || client_secret.is_empty() {
        eprintln!("error: TS_OAUTH_CLIENT_ID and TS_OAUTH_CLIENT_SECRET are required");
        return ExitCode::FAILURE;
    }

    let mut tags: Vec<String> = cli
        .tags
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tags.is_empty() {
        tags.push(DEFAULT_TAG.to_string());
    }

    info!(
        socket = %cli.socket.display(),
        state_dir = %cli.state_dir.display(),
        cluster = %cli.cluster_name,
        tags = ?tags,
        auth_key_ttl = ?cli.auth_key_ttl,
        "starting tailnetd"
    );

    if let Err(e) = fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&cli.state_dir)
    {
        eprintln!("error: creating state directory: {e}");
        return ExitCode::FAILURE;
    }

    let oauth = match OauthManager::new(client_id, client_secret, tags, cli.auth_key_ttl) {
        Ok(mgr) => Arc::new(mgr),
        Err(e) => {
            eprintln!("error: initializing credential manager: {e}");
            return ExitCode::FAILURE;
        }
    };

    let netlink = match Netlink::connect() {
        Ok(nl) => nl,
        Err(e) => {
            eprintln!("error: opening netlink socket: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pods = Arc::new(PodManager::new(
        StatePaths::new(&cli.state_dir),
        cli.cluster_name,
        cli.control_url,
        oauth,
        netlink,
    ));

    info!("recovering pods from previous session");
    let (recovered, errors) = pods.recover_all().await;
    info!(recovered, "recovery pass complete");
    for (container_id, e) in errors {
        warn!(container = %container_id, error = %e, "recovery error");
    }

    pods.cleanup_orphaned_resources().await;

    let server = match Server::start(&cli.socket, pods.clone()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("error: starting rpc server: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("daemon ready");

    wait_for_shutdown_signal().await;
    info!("shutting down");

    server.stop().await;
    pods.close().await;

    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT"),
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => {
            error!("signal handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}
