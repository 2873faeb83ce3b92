//! Thin wrapper over the kernel's rtnetlink interface.
//!
//! Everything the daemon does to kernel network objects goes through here:
//! veth creation, link moves across namespaces, addresses, link-scope
//! routes, enumeration for orphan sweeps, and the two sysctls the bridge
//! needs. One `Netlink` is connected per network namespace; handles are
//! cheap to clone.

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;
use std::path::Path;

use futures_util::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteScope};
use rtnetlink::{Handle, IpVersion};

#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("{context}: {source}")]
    Request {
        context: String,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("netlink connection: {0}")]
    Connection(std::io::Error),

    #[error("sysctl {key}: {source}")]
    Sysctl {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl NetlinkError {
    /// True when the kernel rejected the request because the object already
    /// exists (`EEXIST`). Route installs treat this as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::Request { source: rtnetlink::Error::NetlinkError(msg), .. }
                if msg.raw_code() == -libc::EEXIST
        )
    }

    fn is_not_found_code(err: &rtnetlink::Error) -> bool {
        matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -libc::ENODEV)
    }
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

fn request_err(context: impl Into<String>) -> impl FnOnce(rtnetlink::Error) -> NetlinkError {
    let context = context.into();
    move |source| NetlinkError::Request { context, source }
}

#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Open an rtnetlink socket in the current network namespace and drive
    /// it from the current tokio runtime.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _messages) =
            rtnetlink::new_connection().map_err(NetlinkError::Connection)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Create a veth pair; `name` carries the MTU, the peer inherits it.
    pub async fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        let mut req = self
            .handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string());
        req.message_mut().attributes.push(LinkAttribute::Mtu(mtu));
        req.execute()
            .await
            .map_err(request_err(format!("creating veth pair {name}/{peer}")))
    }

    /// Look up a link's index by name in the current namespace.
    pub async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetlinkError::LinkNotFound(name.to_string())),
            Err(e) if NetlinkError::is_not_found_code(&e) => {
                Err(NetlinkError::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(request_err(format!("looking up link {name}"))(e)),
        }
    }

    pub async fn link_exists(&self, name: &str) -> Result<bool> {
        match self.link_index(name).await {
            Ok(_) => Ok(true),
            Err(NetlinkError::LinkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn link_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(request_err(format!("bringing link {index} up")))
    }

    /// Move a link into the namespace identified by an open fd.
    pub async fn move_link_to_ns_fd(&self, index: u32, ns_fd: RawFd) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(request_err(format!("moving link {index} to namespace")))
    }

    pub async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(request_err(format!("deleting link {index}")))
    }

    /// Delete a link by name, tolerating absence.
    pub async fn delete_link_if_exists(&self, name: &str) -> Result<bool> {
        match self.link_index(name).await {
            Ok(index) => {
                self.delete_link(index).await?;
                Ok(true)
            }
            Err(NetlinkError::LinkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn add_address(&self, index: u32, addr: IpAddr, prefix: u8) -> Result<()> {
        self.handle
            .address()
            .add(index, addr, prefix)
            .execute()
            .await
            .map_err(request_err(format!("adding address {addr}/{prefix}")))
    }

    /// Remove an address from a link, tolerating absence.
    pub async fn del_address(&self, index: u32, addr: IpAddr) -> Result<bool> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addrs
            .try_next()
            .await
            .map_err(request_err("listing addresses"))?
        {
            let matches = msg
                .attributes
                .iter()
                .any(|attr| matches!(attr, AddressAttribute::Address(a) if *a == addr));
            if matches {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(request_err(format!("deleting address {addr}")))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Install a link-scope IPv4 route through `index`.
    pub async fn add_route_v4(&self, dst: Ipv4Addr, prefix: u8, index: u32) -> Result<()> {
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst, prefix)
            .output_interface(index)
            .scope(RouteScope::Link)
            .execute()
            .await
            .map_err(request_err(format!("adding route {dst}/{prefix}")))
    }

    /// Install or overwrite a link-scope IPv4 route through `index`.
    pub async fn replace_route_v4(&self, dst: Ipv4Addr, prefix: u8, index: u32) -> Result<()> {
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst, prefix)
            .output_interface(index)
            .scope(RouteScope::Link)
            .replace()
            .execute()
            .await
            .map_err(request_err(format!("replacing route {dst}/{prefix}")))
    }

    /// Delete the IPv4 route to `dst/prefix`, tolerating absence.
    pub async fn del_route_v4(&self, dst: Ipv4Addr, prefix: u8) -> Result<bool> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(request_err("listing routes"))?
        {
            if msg.header.destination_prefix_length != prefix {
                continue;
            }
            let matches = msg.attributes.iter().any(|attr| {
                matches!(
                    attr,
                    RouteAttribute::Destination(RouteAddress::Inet(a)) if *a == dst
                )
            });
            if matches {
                self.handle
                    .route()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(request_err(format!("deleting route {dst}/{prefix}")))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Names of every link in the current namespace.
    pub async fn list_link_names(&self) -> Result<Vec<String>> {
        let mut links = self.handle.link().get().execute();
        let mut names = Vec::new();
        while let Some(msg) = links
            .try_next()
            .await
            .map_err(request_err("listing links"))?
        {
            if let Some(name) = link_name(&msg) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn link_name(msg: &LinkMessage) -> Option<String> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

/// Write a sysctl under `/proc/sys`, skipping the write when the value is
/// already current. `key` uses slash form, e.g. `net/ipv4/ip_forward`.
pub fn write_sysctl(key: &str, value: &str) -> Result<()> {
    let path = Path::new("/proc/sys").join(key);
    if let Ok(current) = std::fs::read_to_string(&path) {
        if current.trim() == value {
            return Ok(());
        }
    }
    std::fs::write(&path, value).map_err(|source| NetlinkError::Sysctl {
        key: key.to_string(),
        source,
    })
}

/// Sysctl key enabling proxy-ARP on one interface.
pub fn proxy_arp_key(ifname: &str) -> String {
    format!("net/ipv4/conf/{ifname}/proxy_arp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_arp_key_formats() {
        assert_eq!(
            proxy_arp_key("veth0a1b2c3d"),
            "net/ipv4/conf/veth0a1b2c3d/proxy_arp"
        );
    }

    #[tokio::test]
    async fn connect_opens_socket() {
        // Opening an rtnetlink socket needs no privileges.
        let nl = Netlink::connect().unwrap();
        // Loopback exists in every namespace.
        let names = nl.list_link_names().await.unwrap();
        assert!(names.iter().any(|n| n == "lo"));
    }

    #[tokio::test]
    async fn missing_link_reports_not_found() {
        let nl = Netlink::connect().unwrap();
        let err = nl.link_index("definitely-not-a-link").await.unwrap_err();
        assert!(matches!(err, NetlinkError::LinkNotFound(_)));
        assert!(!nl.link_exists("definitely-not-a-link").await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_exists_tolerates_absence() {
        let nl = Netlink::connect().unwrap();
        assert!(!nl.delete_link_if_exists("no-such-veth").await.unwrap());
    }
}
