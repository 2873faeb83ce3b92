//! Pod manager: the registry of live overlay nodes, keyed by container id.
//!
//! Invariants enforced here:
//! - at most one managed pod per container id, ever;
//! - Add is idempotent (a second Add returns the existing pod untouched);
//! - Delete is idempotent and never fails once begun;
//! - every failed Add unwinds to zero kernel objects and no state directory.
//!
//! The registry lock is held only to claim or release an id slot. The slow
//! parts of Add — key minting, engine start, the 60-second address wait —
//! run with the slot marked `Building`, so an Add for one container never
//! blocks a Delete for another.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bridge;
use crate::error::{DaemonError, Result};
use crate::hostname::{self, TUN_PREFIX};
use crate::netlink::Netlink;
use crate::netns;
use crate::node::{NodeBuilder, NodeHandle};
use crate::oauth::OauthManager;
use crate::state::{PodRecord, StatePaths};

/// A live overlay node bound to one container.
pub struct ManagedPod {
    pub container_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub hostname: String,
    pub cluster_ip: String,
    pub host_veth: String,
    pub overlay_ipv4: Ipv4Addr,
    pub overlay_ipv6: Option<Ipv6Addr>,
    pub created_at: DateTime<Utc>,
    node: NodeHandle,
}

enum PodEntry {
    /// Slot claimed by an in-flight Add.
    Building,
    Ready(Arc<ManagedPod>),
}

pub struct AddArgs {
    pub container_id: String,
    pub netns_path: String,
    pub ifname: String,
    pub pod_name: String,
    pub namespace: String,
    pub cluster_ip: String,
}

pub struct PodManager {
    state: StatePaths,
    cluster_name: String,
    control_url: String,
    oauth: Arc<OauthManager>,
    netlink: Netlink,
    pods: RwLock<HashMap<String, PodEntry>>,
}

impl PodManager {
    pub fn new(
        state: StatePaths,
        cluster_name: String,
        control_url: String,
        oauth: Arc<OauthManager>,
        netlink: Netlink,
    ) -> Self {
        Self {
            state,
            cluster_name,
            control_url,
            oauth,
            netlink,
            pods: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or return) the overlay node for a container.
    pub async fn add(&self, args: AddArgs) -> Result<Arc<ManagedPod>> {
        // Claim the id slot.
        {
            let mut pods = self.pods.write().await;
            match pods.get(&args.container_id) {
                Some(PodEntry::Ready(pod)) => {
                    info!(
                        namespace = %args.namespace, pod = %args.pod_name,
                        address = %pod.overlay_ipv4,
                        "pod already exists"
                    );
                    return Ok(pod.clone());
                }
                Some(PodEntry::Building) => {
                    return Err(DaemonError::PodBusy(args.container_id));
                }
                None => {
                    pods.insert(args.container_id.clone(), PodEntry::Building);
                }
            }
        }

        match self.do_add(&args).await {
            Ok(pod) => {
                self.pods
                    .write()
                    .await
                    .insert(args.container_id.clone(), PodEntry::Ready(pod.clone()));
                Ok(pod)
            }
            Err(e) => {
                self.pods.write().await.remove(&args.container_id);
                Err(e)
            }
        }
    }

    async fn do_add(&self, args: &AddArgs) -> Result<Arc<ManagedPod>> {
        let node_hostname =
            hostname::derive(&self.cluster_name, &args.namespace, &args.pod_name);
        info!(
            namespace = %args.namespace, pod = %args.pod_name,
            hostname = %node_hostname,
            "creating overlay node"
        );

        let auth_key = self
            .oauth
            .mint_key(&args.pod_name, &args.namespace)
            .await?;

        self.state.ensure_pod_dir(&args.container_id)?;

        let builder = NodeBuilder::new(&self.netlink, &self.state, self.control_url.clone());
        let (node, status) = match builder
            .build(&args.container_id, &node_hostname, Some(auth_key), false)
            .await
        {
            Ok(built) => built,
            Err(e) => {
                // The builder already unwound its subsystems and the TUN.
                if let Err(remove_err) = self.state.remove_pod_dir(&args.container_id) {
                    warn!(error = %remove_err, "failed to remove state directory");
                }
                return Err(e);
            }
        };

        let overlay_ipv4 = match status.ipv4() {
            Some(ip) => ip,
            None => {
                self.unwind_node(&node, &args.container_id).await;
                return Err(DaemonError::MissingAddress);
            }
        };

        let host_veth = match bridge::build(
            &self.netlink,
            Path::new(&args.netns_path),
            &args.ifname,
            &node.tun_name,
            overlay_ipv4,
            bridge::DEFAULT_VETH_MTU,
        )
        .await
        {
            Ok(name) => name,
            Err(e) => {
                self.unwind_node(&node, &args.container_id).await;
                return Err(e);
            }
        };

        let pod = Arc::new(ManagedPod {
            container_id: args.container_id.clone(),
            pod_name: args.pod_name.clone(),
            namespace: args.namespace.clone(),
            hostname: node_hostname,
            cluster_ip: args.cluster_ip.clone(),
            host_veth,
            overlay_ipv4,
            overlay_ipv6: status.ipv6(),
            created_at: Utc::now(),
            node,
        });

        if let Err(e) = self.save_record(&pod, &args.netns_path) {
            warn!(container = %args.container_id, error = %e, "failed to save metadata");
        }

        Ok(pod)
    }

    /// Reverse a partially-built Add: subsystems down, TUN gone, state
    /// directory removed.
    async fn unwind_node(&self, node: &NodeHandle, container_id: &str) {
        node.shutdown();
        if let Err(e) = self.netlink.delete_link_if_exists(&node.tun_name).await {
            warn!(tun = %node.tun_name, error = %e, "failed to delete TUN during unwind");
        }
        if let Err(e) = self.state.remove_pod_dir(container_id) {
            warn!(container = container_id, error = %e, "failed to remove state directory");
        }
    }

    /// Tear down a container's overlay node. Absent ids are success; kernel
    /// objects that already vanished are ignored.
    pub async fn delete(&self, container_id: &str) -> Result<()> {
        let pod = {
            let mut pods = self.pods.write().await;
            match pods.remove(container_id) {
                None => {
                    info!(container = container_id, "pod not found, already cleaned up");
                    return Ok(());
                }
                Some(PodEntry::Building) => {
                    pods.insert(container_id.to_string(), PodEntry::Building);
                    return Err(DaemonError::PodBusy(container_id.to_string()));
                }
                Some(PodEntry::Ready(pod)) => pod,
            }
        };

        info!(
            namespace = %pod.namespace, pod = %pod.pod_name,
            "deleting overlay node"
        );

        pod.node.shutdown();

        // The pod-side veth end disappears with the namespace.
        if !pod.host_veth.is_empty() {
            if let Err(e) = self.netlink.delete_link_if_exists(&pod.host_veth).await {
                warn!(veth = %pod.host_veth, error = %e, "failed to delete host veth");
            }
        }
        if let Err(e) = self.netlink.delete_link_if_exists(&pod.node.tun_name).await {
            warn!(tun = %pod.node.tun_name, error = %e, "failed to delete TUN");
        }
        if let Err(e) = self.state.remove_pod_dir(container_id) {
            warn!(container = container_id, error = %e, "failed to remove state directory");
        }

        Ok(())
    }

    /// Health of a container's node. Non-mutating.
    pub async fn check(&self, container_id: &str) -> (bool, String) {
        let pods = self.pods.read().await;
        match pods.get(container_id) {
            None => (false, "pod not found".to_string()),
            Some(PodEntry::Building) => (false, "add in progress".to_string()),
            Some(PodEntry::Ready(pod)) => {
                let status = pod.node.backend.status();
                if status.state == tailnet_engine::BackendState::Running {
                    (true, "healthy".to_string())
                } else {
                    (false, format!("backend state is {}", status.state))
                }
            }
        }
    }

    pub async fn get(&self, container_id: &str) -> Option<Arc<ManagedPod>> {
        match self.pods.read().await.get(container_id) {
            Some(PodEntry::Ready(pod)) => Some(pod.clone()),
            _ => None,
        }
    }

    pub async fn get_by_name(&self, namespace: &str, pod_name: &str) -> Option<Arc<ManagedPod>> {
        self.pods
            .read()
            .await
            .values()
            .find_map(|entry| match entry {
                PodEntry::Ready(pod)
                    if pod.namespace == namespace && pod.pod_name == pod_name =>
                {
                    Some(pod.clone())
                }
                _ => None,
            })
    }

    /// Recover every persisted pod whose namespace still exists; orphan-clean
    /// the rest. Per-pod failures are collected, not fatal to the pass.
    pub async fn recover_all(&self) -> (usize, Vec<(String, DaemonError)>) {
        let ids = match self.state.list_pods() {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "failed to read pods directory");
                return (0, vec![("<pods dir>".to_string(), e.into())]);
            }
        };

        let mut recovered = 0;
        let mut errors = Vec::new();
        for container_id in ids {
            match self.recover_pod(&container_id).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(container = %container_id, error = %e, "failed to recover pod");
                    let veth = self
                        .state
                        .load_record(&container_id)
                        .map(|r| r.host_veth_name)
                        .unwrap_or_default();
                    self.cleanup_orphan(&container_id, &veth).await;
                    errors.push((container_id, e));
                }
            }
        }
        (recovered, errors)
    }

    /// Recover a single pod. `Ok(false)` means the pod was gone and its
    /// leftovers were cleaned instead.
    async fn recover_pod(&self, container_id: &str) -> Result<bool> {
        let record = self.state.load_record(container_id)?;

        if !netns::exists(&record.netns_path) {
            info!(
                namespace = %record.namespace, pod = %record.pod_name,
                netns = %record.netns_path,
                "namespace gone, cleaning up"
            );
            self.cleanup_orphan(container_id, &record.host_veth_name).await;
            return Ok(false);
        }

        // Without the engine state file the node would come back with a new
        // identity and a new address; treat it as unrecoverable.
        if !self.state.engine_state_exists(container_id) {
            info!(
                namespace = %record.namespace, pod = %record.pod_name,
                "no engine state, cannot recover with same address"
            );
            self.cleanup_orphan(container_id, &record.host_veth_name).await;
            return Ok(false);
        }

        let expected_ip: Ipv4Addr = record
            .overlay_ipv4
            .parse()
            .map_err(|_| DaemonError::InvalidRecord(record.overlay_ipv4.clone()))?;

        info!(
            namespace = %record.namespace, pod = %record.pod_name,
            container = container_id,
            "recovering pod"
        );

        let builder = NodeBuilder::new(&self.netlink, &self.state, self.control_url.clone());
        let (node, status) = builder
            .build(container_id, &record.hostname, None, true)
            .await?;

        let actual_ip = match status.ipv4() {
            Some(ip) => ip,
            None => {
                node.shutdown();
                return Err(DaemonError::MissingAddress);
            }
        };

        let netns_path = Path::new(&record.netns_path);

        // The control plane may have reassigned the address while we were
        // down; move the pod interface and host route before reconnecting.
        if actual_ip != expected_ip {
            info!(old = %expected_ip, new = %actual_ip, "overlay address changed on recovery");
            if let Err(e) =
                bridge::update_pod_address(netns_path, bridge::POD_IFNAME, expected_ip, actual_ip)
                    .await
            {
                warn!(error = %e, "failed to update pod address");
            }
            if !record.host_veth_name.is_empty() {
                if let Err(e) = bridge::update_host_route(
                    &self.netlink,
                    &record.host_veth_name,
                    expected_ip,
                    actual_ip,
                )
                .await
                {
                    warn!(error = %e, "failed to update host route");
                }
            }
        }

        let host_veth = match bridge::reconnect(
            &self.netlink,
            netns_path,
            &node.tun_name,
            &record.host_veth_name,
            actual_ip,
        )
        .await
        {
            Ok(name) => name,
            Err(e) => {
                node.shutdown();
                return Err(e);
            }
        };

        let pod = Arc::new(ManagedPod {
            container_id: container_id.to_string(),
            pod_name: record.pod_name.clone(),
            namespace: record.namespace.clone(),
            hostname: record.hostname.clone(),
            cluster_ip: record.cluster_ip.clone(),
            host_veth,
            overlay_ipv4: actual_ip,
            overlay_ipv6: status.ipv6(),
            created_at: record.created_at,
            node,
        });

        self.pods
            .write()
            .await
            .insert(container_id.to_string(), PodEntry::Ready(pod.clone()));

        if actual_ip != expected_ip {
            if let Err(e) = self.save_record(&pod, &record.netns_path) {
                warn!(error = %e, "failed to update metadata with new address");
            }
        }

        info!(
            namespace = %pod.namespace, pod = %pod.pod_name,
            address = %pod.overlay_ipv4,
            "recovered pod"
        );
        Ok(true)
    }

    /// Remove leftovers of a pod that no longer runs: TUN, host veth, state
    /// directory. Everything is best-effort.
    async fn cleanup_orphan(&self, container_id: &str, host_veth: &str) {
        info!(container = container_id, "cleaning up orphaned pod");

        let tun = hostname::tun_name(container_id);
        match self.netlink.delete_link_if_exists(&tun).await {
            Ok(true) => info!(tun = %tun, "deleted orphaned TUN"),
            Ok(false) => {}
            Err(e) => warn!(tun = %tun, error = %e, "failed to delete orphaned TUN"),
        }

        if !host_veth.is_empty() {
            match self.netlink.delete_link_if_exists(host_veth).await {
                Ok(true) => info!(veth = host_veth, "deleted orphaned veth"),
                Ok(false) => {}
                Err(e) => warn!(veth = host_veth, error = %e, "failed to delete orphaned veth"),
            }
        }

        if let Err(e) = self.state.remove_pod_dir(container_id) {
            warn!(container = container_id, error = %e, "failed to remove state directory");
        }
    }

    /// Delete every `ts-*` link not owned by a registered pod.
    pub async fn cleanup_orphaned_resources(&self) {
        info!("scanning for orphaned network resources");

        let known: HashSet<String> = {
            let pods = self.pods.read().await;
            pods.keys().map(|id| hostname::tun_name(id)).collect()
        };

        let names = match self.netlink.list_link_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list network interfaces");
                return;
            }
        };

        for name in names {
            if name.starts_with(TUN_PREFIX) && !known.contains(&name) {
                match self.netlink.delete_link_if_exists(&name).await {
                    Ok(true) => info!(tun = %name, "deleted orphaned TUN"),
                    Ok(false) => {}
                    Err(e) => warn!(tun = %name, error = %e, "failed to delete orphaned TUN"),
                }
            }
        }
    }

    /// Shut down every node without touching kernel objects or state: they
    /// are the inputs to the next daemon's recovery pass.
    pub async fn close(&self) {
        let mut pods = self.pods.write().await;
        for (container_id, entry) in pods.drain() {
            if let PodEntry::Ready(pod) = entry {
                info!(container = %container_id, "closing overlay node");
                pod.node.shutdown();
            }
        }
    }

    fn save_record(&self, pod: &ManagedPod, netns_path: &str) -> std::io::Result<()> {
        self.state.save_record(&PodRecord {
            container_id: pod.container_id.clone(),
            pod_name: pod.pod_name.clone(),
            namespace: pod.namespace.clone(),
            hostname: pod.hostname.clone(),
            overlay_ipv4: pod.overlay_ipv4.to_string(),
            overlay_ipv6: pod
                .overlay_ipv6
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            created_at: pod.created_at,
            netns_path: netns_path.to_string(),
            host_veth_name: pod.host_veth.clone(),
            cluster_ip: pod.cluster_ip.clone(),
        })
    }
}
