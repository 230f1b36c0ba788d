//! IPv4 plumbing. The clients are IPv4-only and carry addresses as four raw
//! bytes, so addresses are passed around as `u32` in network order read as a
//! big-endian number.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Parses a dotted-quad string.
pub fn parse_ipv4(address: &str) -> Option<u32> {
    address.parse::<Ipv4Addr>().ok().map(u32::from)
}

pub fn format_ipv4(address: u32) -> String {
    Ipv4Addr::from(address).to_string()
}

pub fn ipv4_of_sockaddr(addr: &SocketAddr) -> Option<u32> {
    match addr.ip() {
        IpAddr::V4(v4) => Some(u32::from(v4)),
        IpAddr::V6(_) => None,
    }
}

/// Whether an address belongs to a private range (or loopback); such peers
/// are told the server's local address instead of the external one.
pub fn is_local_address(address: u32) -> bool {
    let octets = Ipv4Addr::from(address).octets();
    match octets[0] {
        10 | 127 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_roundtrip() {
        let addr = parse_ipv4("192.168.1.10").unwrap();
        assert_eq!(addr, 0xC0A8_010A);
        assert_eq!(format_ipv4(addr), "192.168.1.10");
        assert!(parse_ipv4("not-an-address").is_none());
    }

    #[test]
    fn private_ranges_are_local() {
        assert!(is_local_address(parse_ipv4("10.1.2.3").unwrap()));
        assert!(is_local_address(parse_ipv4("127.0.0.1").unwrap()));
        assert!(is_local_address(parse_ipv4("172.16.0.1").unwrap()));
        assert!(is_local_address(parse_ipv4("172.31.255.1").unwrap()));
        assert!(!is_local_address(parse_ipv4("172.32.0.1").unwrap()));
        assert!(is_local_address(parse_ipv4("192.168.99.1").unwrap()));
        assert!(!is_local_address(parse_ipv4("8.8.8.8").unwrap()));
    }
}
