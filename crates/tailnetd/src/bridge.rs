//! Veth bridge between a container namespace and the host-side TUN.
//!
//! Traffic path: pod `ts0` → veth → host routing (proxy-ARP + ip_forward)
//! → TUN → WireGuard. The pod side carries the overlay address as a /32
//! with a link-scope route for the CGNAT range; the host side gets a /32
//! route back to the pod plus the CGNAT range routed at the TUN.

use std::net::Ipv4Addr;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::netlink::{self, Netlink};
use crate::netns;

/// Default veth MTU: 1500 minus WireGuard overhead (60 bytes for IPv4
/// outer headers, 80 for IPv6) with headroom.
pub const DEFAULT_VETH_MTU: u32 = 1420;

/// The overlay's CGNAT range.
pub const OVERLAY_RANGE: (Ipv4Addr, u8) = (Ipv4Addr::new(100, 64, 0, 0), 10);

/// Canonical in-namespace interface name. The runtime's `eth0` belongs to
/// the primary CNI.
pub const POD_IFNAME: &str = "ts0";

/// Generate a host-side veth name: `veth` + 8 random hex chars, drawn from
/// the OS entropy source so concurrent daemons cannot collide.
pub fn random_host_veth_name() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!("veth{}", hex::encode(bytes))
}

/// Create the veth pair and wire both namespaces. Returns the host-side
/// veth name.
pub async fn build(
    host_netlink: &Netlink,
    netns_path: &Path,
    pod_ifname: &str,
    tun_name: &str,
    overlay_ip: Ipv4Addr,
    mtu: u32,
) -> Result<String> {
    let host_veth = random_host_veth_name();

    // Everything pod-side happens inside the namespace: create the pair,
    // push the host end out by fd, address and route the pod end.
    {
        let pod_ifname = pod_ifname.to_string();
        let host_veth = host_veth.clone();
        netns::run_async_in_namespace(netns_path, move |host_ns_fd| async move {
            let nl = Netlink::connect()?;
            nl.create_veth(&pod_ifname, &host_veth, mtu).await?;
            let pod_index = nl.link_index(&pod_ifname).await?;
            let host_index = nl.link_index(&host_veth).await?;

            nl.move_link_to_ns_fd(host_index, host_ns_fd).await?;

            nl.add_address(pod_index, overlay_ip.into(), 32).await?;
            nl.link_up(pod_index).await?;
            nl.add_route_v4(OVERLAY_RANGE.0, OVERLAY_RANGE.1, pod_index)
                .await?;
            Ok(())
        })
        .await?;
    }

    // Host side: bring the veth up and point routes at it.
    let host_index = host_netlink.link_index(&host_veth).await?;
    host_netlink.link_up(host_index).await?;

    if let Err(e) = host_netlink.add_route_v4(overlay_ip, 32, host_index).await {
        warn!(veth = %host_veth, error = %e, "failed to add route to pod");
    }

    // Proxy-ARP lets the host answer for overlay addresses on the veth;
    // forwarding moves packets between veth and TUN.
    if let Err(e) = netlink::write_sysctl(&netlink::proxy_arp_key(&host_veth), "1") {
        warn!(veth = %host_veth, error = %e, "failed to enable proxy ARP");
    }
    if let Err(e) = netlink::write_sysctl("net/ipv4/ip_forward", "1") {
        warn!(error = %e, "failed to enable IP forwarding");
    }

    let tun_index = host_netlink.link_index(tun_name).await?;
    match host_netlink
        .add_route_v4(OVERLAY_RANGE.0, OVERLAY_RANGE.1, tun_index)
        .await
    {
        Ok(()) => {}
        // Shared by every pod on the node; an earlier pod installed it.
        Err(e) if e.is_already_exists() => {}
        Err(e) => info!(tun = tun_name, error = %e, "adding overlay range route to TUN"),
    }

    info!(pod_if = pod_ifname, veth = %host_veth, tun = tun_name, "veth bridge up");
    Ok(host_veth)
}

/// Refresh the two host routes for an existing veth. Failures are logged;
/// a half-refreshed route set is still better than tearing the pod down.
pub async fn ensure_routes(
    host_netlink: &Netlink,
    tun_name: &str,
    veth_name: &str,
    overlay_ip: Ipv4Addr,
) -> Result<()> {
    let veth_index = host_netlink.link_index(veth_name).await?;
    if let Err(e) = host_netlink
        .replace_route_v4(overlay_ip, 32, veth_index)
        .await
    {
        warn!(veth = veth_name, error = %e, "failed to replace pod route");
    }

    let tun_index = host_netlink.link_index(tun_name).await?;
    if let Err(e) = host_netlink
        .replace_route_v4(OVERLAY_RANGE.0, OVERLAY_RANGE.1, tun_index)
        .await
    {
        warn!(tun = tun_name, error = %e, "failed to replace TUN route");
    }
    Ok(())
}

/// Reattach to a recovered pod's bridge: reuse the recorded veth when it
/// still exists, otherwise rebuild from scratch.
pub async fn reconnect(
    host_netlink: &Netlink,
    netns_path: &Path,
    tun_name: &str,
    existing_veth: &str,
    overlay_ip: Ipv4Addr,
) -> Result<String> {
    if !existing_veth.is_empty() && host_netlink.link_exists(existing_veth).await? {
        debug!(veth = existing_veth, "reusing existing veth");
        if let Err(e) = ensure_routes(host_netlink, tun_name, existing_veth, overlay_ip).await {
            warn!(veth = existing_veth, error = %e, "failed to verify routes");
        }
        return Ok(existing_veth.to_string());
    }

    info!(veth = existing_veth, "veth not found, recreating bridge");
    build(
        host_netlink,
        netns_path,
        POD_IFNAME,
        tun_name,
        overlay_ip,
        DEFAULT_VETH_MTU,
    )
    .await
}

/// Swap the pod interface's overlay address in place after the control
/// plane reassigned it on recovery.
pub async fn update_pod_address(
    netns_path: &Path,
    pod_ifname: &str,
    old_ip: Ipv4Addr,
    new_ip: Ipv4Addr,
) -> Result<()> {
    if old_ip == new_ip {
        return Ok(());
    }
    let pod_ifname = pod_ifname.to_string();
    netns::run_async_in_namespace(netns_path, move |_host_ns_fd| async move {
        let nl = Netlink::connect()?;
        let pod_index = nl.link_index(&pod_ifname).await?;
        match nl.del_address(pod_index, old_ip.into()).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to remove old overlay address"),
        }
        nl.add_address(pod_index, new_ip.into(), 32).await?;
        info!(ifname = %pod_ifname, old = %old_ip, new = %new_ip, "updated pod overlay address");
        Ok(())
    })
    .await?;
    Ok(())
}

/// Move the host-side /32 route from the old overlay address to the new one.
pub async fn update_host_route(
    host_netlink: &Netlink,
    veth_name: &str,
    old_ip: Ipv4Addr,
    new_ip: Ipv4Addr,
) -> Result<()> {
    if old_ip == new_ip {
        return Ok(());
    }
    let veth_index = host_netlink.link_index(veth_name).await?;
    match host_netlink.del_route_v4(old_ip, 32).await {
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to delete old host route"),
    }
    host_netlink.add_route_v4(new_ip, 32, veth_index).await?;
    info!(veth = veth_name, old = %old_ip, new = %new_ip, "updated host route");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn veth_names_are_well_formed() {
        let name = random_host_veth_name();
        assert!(name.starts_with("veth"));
        assert_eq!(name.len(), 12);
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Fits in IFNAMSIZ.
        assert!(name.len() < 16);
    }

    #[test]
    fn veth_names_do_not_collide() {
        let names: HashSet<String> = (0..1000).map(|_| random_host_veth_name()).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn overlay_range_is_cgnat() {
        assert_eq!(OVERLAY_RANGE.0.to_string(), "100.64.0.0");
        assert_eq!(OVERLAY_RANGE.1, 10);
    }
}
