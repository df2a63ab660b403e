use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpParseError {
    #[error("'{}' is not a valid IPv4 address!", .0)]
    InvalidAddress(String),
    #[error("'{}' is not a valid IPv4 CIDR!", .0)]
    InvalidCidr(String),
}

pub fn parse_ipv4(raw: &str) -> Result<Ipv4Addr, IpParseError> {
    raw.parse()
        .map_err(|_| IpParseError::InvalidAddress(raw.to_owned()))
}

pub fn parse_ipv4_net(raw: &str) -> Result<Ipv4Net, IpParseError> {
    raw.parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|_| IpParseError::InvalidCidr(raw.to_owned()))
}

/// The first usable host of a subnet, used as its default gateway.
pub fn generate_default_gateway(subnet: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) | 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_first_host_as_gateway() {
        let subnet: Ipv4Net = "10.1.0.0/24".parse().unwrap();

        assert_eq!(
            generate_default_gateway(subnet),
            "10.1.0.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn parse_ipv4_rejects_ipv6_and_garbage() {
        assert!(parse_ipv4("192.168.1.100").is_ok());
        assert!(parse_ipv4("2001:db8::1").is_err());
        assert!(parse_ipv4("not-an-ip").is_err());
    }

    #[test]
    fn parse_ipv4_net_truncates_host_bits() {
        let net = parse_ipv4_net("192.168.1.77/24").unwrap();

        assert_eq!(net.to_string(), "192.168.1.0/24");
        assert!(parse_ipv4_net("192.168.1.0/33").is_err());
    }
}
