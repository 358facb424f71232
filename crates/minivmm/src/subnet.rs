//! IPv4 CIDR arithmetic for the guest network.
//!
//! The gateway is the **last** usable host address of the subnet and the
//! DHCP pool runs from the first usable address up to (excluding) the
//! gateway.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 32 {
            return Err(Error::invalid(format!("CIDR prefix /{prefix} exceeds 32")));
        }
        let mask = Self::mask_bits(prefix);
        let network = Ipv4Addr::from(u32::from(addr) & mask);
        Ok(Ipv4Cidr { network, prefix })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask_bits(self.prefix))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_bits(self.prefix))
    }

    /// Last usable host address; doubles as the guest gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.broadcast()).saturating_sub(1))
    }

    /// First usable host address; the start of the DHCP pool.
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.network)
    }

    /// Host addresses from `first_host` up to but excluding the gateway,
    /// i.e. the DHCP-allocatable range.
    pub fn pool(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u32::from(self.first_host());
        let end = u32::from(self.gateway());
        (start..end).map(Ipv4Addr::from)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid(format!("invalid CIDR '{s}' (expected a.b.c.d/n)")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::invalid(format!("invalid address in CIDR '{s}'")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::invalid(format!("invalid prefix in CIDR '{s}'")))?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}
