//! Tunnel address allocation from the configured IPv4 pool.
//!
//! The pool is scanned in ascending order on every call, which is fine for
//! enrollment-time allocation. Callers must hold the storage enrollment lock
//! across "read allocated addresses" and "persist the new record".

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

pub const DEFAULT_TUNNEL_CIDR: &str = "10.255.240.0/21";

/// The control plane's own tunnel address.
pub const DEFAULT_RESERVED_IP: Ipv4Addr = Ipv4Addr::new(10, 255, 240, 1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("invalid tunnel CIDR {cidr}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("no free address left in {0}")]
    ExhaustedPool(Ipv4Net),
}

/// Hands out the lowest free host address of a prefix.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    network: Ipv4Net,
    reserved: HashSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Build an allocator for `cidr`. Host bits in `cidr` are ignored.
    pub fn new(
        cidr: &str,
        reserved: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Result<Self, AllocatorError> {
        let network = cidr
            .trim()
            .parse::<Ipv4Net>()
            .map_err(|e| AllocatorError::InvalidCidr {
                cidr: cidr.to_string(),
                reason: e.to_string(),
            })?
            .trunc();

        Ok(Self {
            network,
            reserved: reserved.into_iter().collect(),
        })
    }

    pub const fn network(&self) -> Ipv4Net {
        self.network
    }

    pub const fn reserved(&self) -> &HashSet<Ipv4Addr> {
        &self.reserved
    }

    /// Return the first candidate address that is neither in `allocated` nor reserved.
    pub fn next_ip(&self, allocated: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AllocatorError> {
        self.candidates()
            .find(|ip| !allocated.contains(ip) && !self.reserved.contains(ip))
            .ok_or(AllocatorError::ExhaustedPool(self.network))
    }

    /// Host addresses in ascending order. Network and broadcast addresses are
    /// skipped unless the prefix is a single /32.
    fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network.network());
        let last = u32::from(self.network.broadcast());
        let (start, end) = if self.network.prefix_len() == 32 {
            (first, first)
        } else {
            (first.saturating_add(1), last.saturating_sub(1))
        };
        (start..=end).map(Ipv4Addr::from)
    }
}
