//! Local interface discovery
//!
//! Finds the IPv4 address other devices on the hotspot should use to reach
//! the proxy. Access-point style interfaces win; tunnels never qualify.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, warn};

/// Interface enumeration errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("interface enumeration failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Name fragments of interfaces that carry a shared network
const SHARING_HINTS: [&str; 3] = ["ap", "rndis", "wlan"];

/// Name fragment of VPN tunnels
const TUNNEL_HINT: &str = "tun";

/// One IPv4 address bound to a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub name: String,
    pub addr: Ipv4Addr,
    pub up: bool,
    pub loopback: bool,
}

/// Enumerate the IPv4 addresses of every local interface
#[cfg(unix)]
pub fn interfaces() -> Result<Vec<InterfaceAddress>> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    let mut found = Vec::new();
    let mut current = head;
    while !current.is_null() {
        let ifa = unsafe { &*current };
        current = ifa.ifa_next;

        if ifa.ifa_addr.is_null() {
            continue;
        }
        if unsafe { (*ifa.ifa_addr).sa_family } as i32 != libc::AF_INET {
            continue;
        }

        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        let flags = ifa.ifa_flags as libc::c_int;
        found.push(InterfaceAddress {
            name: unsafe { CStr::from_ptr(ifa.ifa_name) }
                .to_string_lossy()
                .into_owned(),
            addr: Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
            up: flags & libc::IFF_UP != 0,
            loopback: flags & libc::IFF_LOOPBACK != 0,
        });
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(found)
}

#[cfg(not(unix))]
pub fn interfaces() -> Result<Vec<InterfaceAddress>> {
    Ok(Vec::new())
}

/// Choose the address to advertise from a list of interface addresses
///
/// Loopback, down and tunnel interfaces are skipped. The first interface
/// whose name looks like a hotspot or tethering link wins; otherwise the
/// last remaining candidate is used, and localhost if there is none.
pub fn pick_share_address(candidates: &[InterfaceAddress]) -> Ipv4Addr {
    let mut chosen = Ipv4Addr::LOCALHOST;

    for candidate in candidates {
        if candidate.loopback || !candidate.up || candidate.name.contains(TUNNEL_HINT) {
            continue;
        }
        if SHARING_HINTS.iter().any(|hint| candidate.name.contains(hint)) {
            return candidate.addr;
        }
        chosen = candidate.addr;
    }

    chosen
}

/// Best address for other devices to reach this host, localhost on failure
pub fn local_ip_address() -> Ipv4Addr {
    match interfaces() {
        Ok(list) => {
            let addr = pick_share_address(&list);
            debug!(%addr, interfaces = list.len(), "share address selected");
            addr
        }
        Err(e) => {
            warn!(error = %e, "falling back to localhost");
            Ipv4Addr::LOCALHOST
        }
    }
}
