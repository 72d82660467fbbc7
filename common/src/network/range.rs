use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use pnet::ipnetwork::IpNetwork;

use crate::error::{Error, Result};

/// A validated CIDR block handed to the scanners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanNetwork {
    network: IpNetwork,
}

impl ScanNetwork {
    /// Parses `network_cidr` strictly: an address, a slash and a prefix.
    ///
    /// A bare address is rejected; scanning a single host still has to be
    /// spelled out as `/32` (or `/128`).
    pub fn parse(network_cidr: &str) -> Result<Self> {
        let trimmed = network_cidr.trim();
        let Some((addr, prefix)) = trimmed.split_once('/') else {
            return Err(Error::invalid_argument(
                "network_cidr",
                format!("'{trimmed}' is not in CIDR notation"),
            ));
        };

        let addr: IpAddr = addr.parse().map_err(|e| {
            Error::invalid_argument("network_cidr", format!("invalid address '{addr}': {e}"))
        })?;
        let prefix: u8 = prefix.parse().map_err(|e| {
            Error::invalid_argument("network_cidr", format!("invalid prefix '{prefix}': {e}"))
        })?;
        let network = IpNetwork::new(addr, prefix)
            .map_err(|e| Error::invalid_argument("network_cidr", e.to_string()))?;

        Ok(Self { network })
    }

    pub fn inner(&self) -> IpNetwork {
        self.network
    }

    /// Number of addresses covered by the block, saturating for huge IPv6 blocks.
    pub fn address_count(&self) -> u128 {
        match self.network {
            IpNetwork::V4(v4) => 1u128 << (32 - u32::from(v4.prefix())),
            IpNetwork::V6(v6) => {
                let host_bits = 128 - u32::from(v6.prefix());
                if host_bits >= 128 {
                    u128::MAX
                } else {
                    1u128 << host_bits
                }
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.network.contains(ip)
    }

    /// Usable IPv4 host range (network and broadcast stripped when possible).
    pub fn ipv4_hosts(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        let IpNetwork::V4(net) = self.network else {
            return None;
        };
        let start = u32::from(net.network());
        let end = u32::from(net.broadcast());
        if end.saturating_sub(start) >= 2 {
            Some((Ipv4Addr::from(start + 1), Ipv4Addr::from(end - 1)))
        } else {
            Some((net.network(), net.broadcast()))
        }
    }
}

impl FromStr for ScanNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ScanNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network.network(), self.network.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_cidr() {
        let net = ScanNetwork::parse("192.168.1.0/24").unwrap();
        assert_eq!(net.address_count(), 256);
        assert_eq!(net.to_string(), "192.168.1.0/24");
        assert_eq!(
            net.ipv4_hosts(),
            Some((Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 254)))
        );
    }

    #[test]
    fn normalizes_host_bits() {
        let net = ScanNetwork::parse("10.0.0.77/30").unwrap();
        assert_eq!(net.to_string(), "10.0.0.76/30");
        assert_eq!(net.address_count(), 4);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "10.0.0.1", "10.0.0.0/33", "10.0.0/24", "lan", "10.0.0.0/x"] {
            let err = ScanNetwork::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidArgument { name: "network_cidr", .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn tiny_networks_keep_all_addresses() {
        let net = ScanNetwork::parse("10.1.1.4/31").unwrap();
        assert_eq!(
            net.ipv4_hosts(),
            Some((Ipv4Addr::new(10, 1, 1, 4), Ipv4Addr::new(10, 1, 1, 5)))
        );
    }
}
