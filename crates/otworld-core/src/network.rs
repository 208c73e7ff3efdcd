//! Server address set used for access control and address advertisement.
//!
//! Built once during bootstrap from three sources:
//!
//! ```text
//!   127.0.0.1          mask 255.255.255.255   loopback
//!   <hostname addrs>   mask 255.255.255.255   every address the host resolves to
//!   <configured ip>    mask 0.0.0.0           public address, matches anything
//! ```
//!
//! [`ServerAddresses::advertised_for`] walks the list in that order, so a
//! local client is told the local address and everyone else gets the
//! public one.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use tracing::debug;

use crate::collaborators::NetworkIdentity;

/// An address with the mask a client address is compared under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMask {
    /// Server address.
    pub addr: Ipv4Addr,
    /// Mask applied to both sides before comparing.
    pub mask: Ipv4Addr,
}

impl AddressMask {
    /// Whether `client` falls under this entry.
    pub fn matches(&self, client: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(client) & mask) == (u32::from(self.addr) & mask)
    }
}

/// Ordered set of server addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerAddresses {
    entries: Vec<AddressMask>,
}

impl ServerAddresses {
    /// Build the set from the host's own addresses and the resolved public
    /// address.
    pub fn new(local: impl IntoIterator<Item = Ipv4Addr>, public: Ipv4Addr) -> Self {
        let mut entries = vec![AddressMask {
            addr: Ipv4Addr::LOCALHOST,
            mask: Ipv4Addr::BROADCAST,
        }];
        entries.extend(local.into_iter().map(|addr| AddressMask {
            addr,
            mask: Ipv4Addr::BROADCAST,
        }));
        entries.push(AddressMask {
            addr: public,
            mask: Ipv4Addr::UNSPECIFIED,
        });
        Self { entries }
    }

    /// Entries in lookup order.
    pub fn entries(&self) -> &[AddressMask] {
        &self.entries
    }

    /// Address to advertise to `client`: the first entry matching it.
    pub fn advertised_for(&self, client: Ipv4Addr) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|entry| entry.matches(client))
            .map(|entry| entry.addr)
    }

    /// The configured public address (the catch-all entry).
    pub fn public(&self) -> Option<Ipv4Addr> {
        self.entries.last().map(|entry| entry.addr)
    }
}

/// Parse `host` as an IPv4 literal, falling back to a DNS lookup.
pub fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    let host = host.trim();
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Some(addr);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|sock| match sock.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

/// Every IPv4 address `host` resolves to, without duplicates.
fn resolve_all_ipv4(host: &str) -> Vec<Ipv4Addr> {
    let mut found = Vec::new();
    if let Ok(addrs) = (host, 0).to_socket_addrs() {
        for sock in addrs {
            if let IpAddr::V4(v4) = sock.ip() {
                if !found.contains(&v4) {
                    found.push(v4);
                }
            }
        }
    }
    found
}

/// Resolves addresses through the operating system.
///
/// The host name comes from `HOSTNAME`, then `/etc/hostname`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetworkIdentity;

impl SystemNetworkIdentity {
    fn hostname() -> Option<String> {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
    }
}

impl NetworkIdentity for SystemNetworkIdentity {
    fn local_host_addresses(&self) -> Vec<Ipv4Addr> {
        let Some(name) = Self::hostname() else {
            debug!("host name unavailable, skipping local address lookup");
            return Vec::new();
        };
        let addrs = resolve_all_ipv4(&name);
        debug!(host = %name, count = addrs.len(), "resolved local host addresses");
        addrs
    }

    fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        resolve_ipv4(host)
    }
}
