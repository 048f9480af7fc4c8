//! ST-021: IPv4 CIDR arithmetic.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network: base address (host bits zero) and prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    base: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 32 {
            return Err(format!("prefix /{} exceeds 32", prefix));
        }
        let base = u32::from(addr);
        if base & !mask(prefix) != 0 {
            return Err(format!(
                "{}/{} has host bits set (network is {}/{})",
                addr,
                prefix,
                Ipv4Addr::from(base & mask(prefix)),
                prefix
            ));
        }
        Ok(Self { base, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.base & mask(self.prefix) == self.base
    }

    /// Child network `netnum` after extending the prefix by `newbits`.
    pub fn subnet(&self, newbits: u8, netnum: u32) -> Result<Ipv4Cidr, String> {
        let prefix = u32::from(self.prefix) + u32::from(newbits);
        if prefix > 32 {
            return Err(format!(
                "cannot extend /{} by {} bits",
                self.prefix, newbits
            ));
        }
        if u64::from(netnum) >= 1u64 << newbits {
            return Err(format!(
                "network number {} does not fit in {} bits",
                netnum, newbits
            ));
        }
        let shift = 32 - prefix;
        let offset = if shift >= 32 { 0 } else { netnum << shift };
        Ok(Ipv4Cidr {
            base: self.base | offset,
            prefix: prefix as u8,
        })
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is missing a /prefix", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("'{}' is not an IPv4 address", addr))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("'{}' is not a prefix length", prefix))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}
