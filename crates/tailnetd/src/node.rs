//! Per-container engine lifecycle.
//!
//! Builds the full subsystem stack for one overlay node — TUN, dialer,
//! network monitor, WireGuard engine, netstack, state store, control client,
//! backend — in registry order, starts it, and waits for the control plane
//! to assign an IPv4 overlay address. Every intermediate failure unwinds in
//! reverse order; on success the caller owns a [`NodeHandle`].
//!
//! The same sequence serves recovery: the TUN link is deleted and recreated
//! (a crashed daemon's device cannot be re-adopted), the state store already
//! holds the node key, and no auth key is supplied.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use tailnet_engine::{
    Dialer, FileStore, HttpControlClient, LocalBackend, Netstack, NetworkMonitor, NodeStatus,
    Prefs, Registry, StartOptions, TunDevice, UserspaceEngine,
};

use crate::error::{DaemonError, Result};
use crate::hostname;
use crate::netlink::Netlink;
use crate::state::StatePaths;

/// How long to wait for the control plane to report a running node with an
/// IPv4 address before unwinding.
const ADDRESS_WAIT: Duration = Duration::from_secs(60);
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Live handles for one overlay node. Shutdown order mirrors construction
/// in reverse.
pub struct NodeHandle {
    pub backend: Arc<LocalBackend>,
    pub netstack: Arc<Netstack>,
    pub engine: Arc<UserspaceEngine>,
    pub netmon: Arc<NetworkMonitor>,
    pub tun_name: String,
}

impl NodeHandle {
    /// Stop the node's subsystems. Kernel objects and on-disk state are the
    /// caller's to keep (daemon shutdown) or remove (pod delete).
    pub fn shutdown(&self) {
        self.backend.shutdown();
        self.netstack.close();
        self.engine.close();
        self.netmon.close();
    }
}

pub struct NodeBuilder<'a> {
    netlink: &'a Netlink,
    state: &'a StatePaths,
    control_url: String,
}

impl<'a> NodeBuilder<'a> {
    pub fn new(netlink: &'a Netlink, state: &'a StatePaths, control_url: String) -> Self {
        Self {
            netlink,
            state,
            control_url,
        }
    }

    /// Build and start the node for `container_id`, waiting for its overlay
    /// address. `auth_key` is `Some` on first Add and `None` on recovery.
    pub async fn build(
        &self,
        container_id: &str,
        node_hostname: &str,
        auth_key: Option<String>,
        recover: bool,
    ) -> Result<(NodeHandle, NodeStatus)> {
        let tun_name = hostname::tun_name(container_id);

        // A device left by a previous daemon run holds no usable queue; it
        // must be recreated before the engine can attach.
        if recover {
            self.netlink.delete_link_if_exists(&tun_name).await?;
        }

        let tun = TunDevice::create(&tun_name).map_err(DaemonError::Engine)?;
        let actual_tun_name = tun.name().to_string();
        debug!(tun = %actual_tun_name, container = container_id, "created TUN device");

        let tun_index = match self.netlink.link_index(&actual_tun_name).await {
            Ok(index) => index,
            Err(e) => {
                let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.netlink.link_up(tun_index).await {
            let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
            return Err(e.into());
        }

        let mut registry = Registry::new();

        let dialer = match Dialer::new() {
            Ok(dialer) => Arc::new(dialer),
            Err(e) => {
                let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
                return Err(e.into());
            }
        };
        registry.set_dialer(dialer.clone());

        let netmon = Arc::new(NetworkMonitor::new());
        registry.set_netmon(netmon.clone());

        let engine = match UserspaceEngine::new(&mut registry, &tun) {
            Ok(engine) => engine,
            Err(e) => {
                netmon.close();
                let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
                return Err(e.into());
            }
        };

        // Unwinds everything built so far, in reverse.
        let unwind = |netmon: &NetworkMonitor, engine: &UserspaceEngine| {
            engine.close();
            netmon.close();
        };

        let netstack = match Netstack::create(&mut registry) {
            Ok(ns) => ns,
            Err(e) => {
                unwind(&netmon, &engine);
                let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
                return Err(e.into());
            }
        };
        // Kernel routing carries pod traffic; the netstack only tracks
        // lifecycle.
        netstack.set_processing(false, false);

        let store = match FileStore::load_or_create(self.state.engine_state(container_id)) {
            Ok(store) => store,
            Err(e) => {
                netstack.close();
                unwind(&netmon, &engine);
                let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
                return Err(e.into());
            }
        };
        registry.set_store(store);

        registry.set_control(Arc::new(HttpControlClient::new(
            self.control_url.clone(),
            dialer,
        )));

        let result: Result<(Arc<LocalBackend>, NodeStatus)> = async {
            let backend = LocalBackend::new(&registry).map_err(DaemonError::Engine)?;
            netstack.start(&backend).map_err(DaemonError::Engine)?;

            backend
                .start(StartOptions {
                    auth_key,
                    prefs: Prefs {
                        hostname: node_hostname.to_string(),
                        want_running: true,
                        control_url: self.control_url.clone(),
                    },
                })
                .map_err(DaemonError::Engine)?;

            if backend.state() == tailnet_engine::BackendState::NeedsLogin {
                debug!(container = container_id, "state is NeedsLogin, starting login");
                backend
                    .start_login_interactive()
                    .map_err(DaemonError::Engine)?;
            }

            let status = wait_for_address(&backend).await?;
            Ok((backend, status))
        }
        .await;

        match result {
            Ok((backend, status)) => {
                info!(
                    container = container_id,
                    tun = %actual_tun_name,
                    address = ?status.ipv4(),
                    "overlay node up"
                );
                Ok((
                    NodeHandle {
                        backend,
                        netstack,
                        engine,
                        netmon,
                        tun_name: actual_tun_name,
                    },
                    status,
                ))
            }
            Err(e) => {
                netstack.close();
                unwind(&netmon, &engine);
                let _ = self.netlink.delete_link_if_exists(&actual_tun_name).await;
                Err(e)
            }
        }
    }
}

/// Poll the backend until it is running with an IPv4 overlay address.
async fn wait_for_address(backend: &LocalBackend) -> Result<NodeStatus> {
    let deadline = Instant::now() + ADDRESS_WAIT;
    loop {
        let status = backend.status();
        if status.state == tailnet_engine::BackendState::Running && status.ipv4().is_some() {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            backend.shutdown();
            return Err(DaemonError::AddressTimeout {
                state: status.state.to_string(),
            });
        }
        tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
    }
}
