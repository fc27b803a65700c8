//! IPv4 CIDR arithmetic for subnet allocation and overlap checks

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        Some(Self {
            network: u32::from(addr) & mask(prefix),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn last(&self) -> u32 {
        self.network | !mask(self.prefix)
    }

    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == self.network
    }

    /// Whether `other` lies entirely inside this block
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && self.contains_addr(other.network())
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.network <= other.last() && other.network <= self.last()
    }

    /// Split into blocks of `/new_prefix`, in address order
    pub fn subdivide(&self, new_prefix: u8) -> Vec<Ipv4Cidr> {
        if new_prefix < self.prefix || new_prefix > 32 {
            return Vec::new();
        }
        let count = 1u64 << (new_prefix - self.prefix);
        let step = 1u64 << (32 - new_prefix);
        (0..count)
            .map(|i| Ipv4Cidr {
                network: (self.network as u64 + i * step) as u32,
                prefix: new_prefix,
            })
            .collect()
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    /// Parses `a.b.c.d/n`; host bits must be zero
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("{:?} is not a CIDR", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("{:?} has an invalid address", s))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("{:?} has an invalid prefix length", s))?;
        let cidr = Ipv4Cidr::new(addr, prefix).ok_or_else(|| format!("{:?} prefix exceeds 32", s))?;
        if cidr.network() != addr {
            return Err(format!("{:?} has host bits set", s));
        }
        Ok(cidr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(c("172.20.0.0/16").to_string(), "172.20.0.0/16");
        assert!("172.20.0.1/16".parse::<Ipv4Cidr>().is_err());
        assert!("172.20.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("172.20.0.0/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_overlap_and_contains() {
        let net = c("172.20.0.0/16");
        assert!(net.contains(&c("172.20.32.0/19")));
        assert!(!net.contains(&c("172.21.0.0/19")));
        assert!(c("10.0.0.0/8").overlaps(&c("10.1.0.0/16")));
        assert!(!c("10.0.0.0/16").overlaps(&c("10.1.0.0/16")));
        assert!(c("0.0.0.0/0").contains(&c("192.168.0.0/24")));
    }

    #[test]
    fn test_subdivide() {
        let blocks = c("172.20.0.0/16").subdivide(19);
        assert_eq!(blocks.len(), 8);
        assert_eq!(blocks[1].to_string(), "172.20.32.0/19");
        assert_eq!(blocks[7].to_string(), "172.20.224.0/19");
        let utility = blocks[7].subdivide(22);
        assert_eq!(utility[0].to_string(), "172.20.224.0/22");
        assert!(c("10.0.0.0/24").subdivide(19).is_empty());
    }
}
