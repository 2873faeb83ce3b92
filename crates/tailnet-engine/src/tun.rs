//! Host-namespace TUN device creation.
//!
//! The device is made persistent (`TUNSETPERSIST`) so it outlives both this
//! process and the creating file descriptor: the WireGuard device attaches to
//! it by name afterwards, and after a daemon crash the link remains for
//! recovery to delete-and-recreate. Callers remove the link through netlink
//! when the container is torn down.

use std::io;

use crate::error::{EngineError, Result};

const IFNAMSIZ: usize = 16;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 24 - std::mem::size_of::<libc::c_short>()],
}

fn write_ifname(dst: &mut [libc::c_char; IFNAMSIZ], name: &str) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name {name:?} must be 1..{IFNAMSIZ} bytes"),
        ));
    }
    for (i, &b) in bytes.iter().enumerate() {
        dst[i] = b as libc::c_char;
    }
    Ok(())
}

fn ifname_from_c(src: &[libc::c_char; IFNAMSIZ]) -> String {
    let len = src.iter().position(|&c| c == 0).unwrap_or(IFNAMSIZ);
    src[..len].iter().map(|&c| c as u8 as char).collect()
}

/// A persistent TUN link in the host namespace.
#[derive(Debug, Clone)]
pub struct TunDevice {
    name: String,
}

impl TunDevice {
    /// Create (or attach to) the TUN link `requested` and mark it persistent.
    ///
    /// Returns the name the kernel actually assigned.
    pub fn create(requested: &str) -> Result<Self> {
        let fd = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(EngineError::Tun(io::Error::last_os_error()));
        }

        let mut ifr = IfReqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 24 - std::mem::size_of::<libc::c_short>()],
        };
        if let Err(e) = write_ifname(&mut ifr.ifr_name, requested) {
            unsafe { libc::close(fd) };
            return Err(EngineError::Tun(e));
        }

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &ifr) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(EngineError::Tun(err));
        }

        let ret = unsafe { libc::ioctl(fd, TUNSETPERSIST as _, 1usize) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(EngineError::Tun(err));
        }

        let name = ifname_from_c(&ifr.ifr_name);

        // The link is persistent now; release our queue so the WireGuard
        // device can attach to it by name.
        unsafe { libc::close(fd) };

        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifname_roundtrip() {
        let mut buf = [0 as libc::c_char; IFNAMSIZ];
        write_ifname(&mut buf, "ts-0123abcd").unwrap();
        assert_eq!(ifname_from_c(&buf), "ts-0123abcd");
    }

    #[test]
    fn ifname_rejects_empty_and_long() {
        let mut buf = [0 as libc::c_char; IFNAMSIZ];
        assert!(write_ifname(&mut buf, "").is_err());
        assert!(write_ifname(&mut buf, "sixteen-chars-xx").is_err());
        assert!(write_ifname(&mut buf, "fifteen-chars-x").is_ok());
    }
}
