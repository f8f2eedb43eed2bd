use crate::error::{MimirError, Result};
use std::net::{IpAddr, SocketAddr};

/// Split an address literal into host and optional port. The port is
/// separated by `#` or `@` and must fall in [1, 65535].
pub fn split_host_port(input: &str) -> Result<(String, Option<u16>)> {
    let sep = input.find(['#', '@']);
    match sep {
        None => Ok((input.to_string(), None)),
        Some(pos) => {
            let (host, rest) = input.split_at(pos);
            let port_str = &rest[1..];
            if port_str.is_empty() {
                return Err(MimirError::InvalidAddress(input.to_string()));
            }
            let port: u32 = port_str
                .parse()
                .map_err(|_| MimirError::InvalidAddress(input.to_string()))?;
            if port == 0 || port > u16::MAX as u32 {
                return Err(MimirError::InvalidAddress(input.to_string()));
            }
            Ok((host.to_string(), Some(port as u16)))
        }
    }
}

/// Render an address and port in the `host#port` literal form.
pub fn join_host_port(addr: IpAddr, port: u16) -> String {
    format!("{}#{}", addr, port)
}

/// Parse an address literal with an optional `#`/`@` port into a socket
/// address, falling back to `default_port`.
pub fn parse_socket_addr(input: &str, default_port: u16) -> Result<SocketAddr> {
    let (host, port) = split_host_port(input)?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| MimirError::InvalidAddress(input.to_string()))?;
    Ok(SocketAddr::new(ip, port.unwrap_or(default_port)))
}

/// Set the port of a socket address. Only the field matching the address
/// family is written.
pub fn set_port(addr: &mut SocketAddr, port: u16) {
    addr.set_port(port);
}

/// Parse `addr` or `addr/bits` into an address and prefix length. Bits must
/// fall in [0, 32] for IPv4 and [0, 128] for IPv6; a missing suffix means
/// the full host length.
pub fn parse_subnet(input: &str) -> Result<(IpAddr, u8)> {
    let (addr_str, bits_str) = match input.split_once('/') {
        Some((addr, bits)) => (addr, Some(bits)),
        None => (input, None),
    };
    let addr: IpAddr = addr_str
        .parse()
        .map_err(|_| MimirError::InvalidSubnet(input.to_string()))?;
    let max_bits: u8 = if addr.is_ipv6() { 128 } else { 32 };
    let bits = match bits_str {
        None => max_bits,
        Some(text) => {
            let bits: u8 = text
                .parse()
                .map_err(|_| MimirError::InvalidSubnet(input.to_string()))?;
            if bits > max_bits {
                return Err(MimirError::InvalidSubnet(input.to_string()));
            }
            bits
        }
    };
    Ok((addr, bits))
}

/// Compare the leading `bits` bits of two byte strings, memcmp-style.
pub fn bit_prefix_cmp(a: &[u8], b: &[u8], bits: usize) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let whole = bits / 8;
    let head = a[..whole].cmp(&b[..whole]);
    if head != Ordering::Equal {
        return head;
    }
    let rest = bits % 8;
    if rest == 0 {
        return Ordering::Equal;
    }
    let shift = 8 - rest;
    (a[whole] >> shift).cmp(&(b[whole] >> shift))
}

/// Whether `addr` falls inside the subnet `(base, bits)`.
pub fn subnet_contains(base: IpAddr, bits: u8, addr: IpAddr) -> bool {
    match (base, addr) {
        (IpAddr::V4(base), IpAddr::V4(addr)) => {
            bit_prefix_cmp(&base.octets(), &addr.octets(), bits as usize)
                == std::cmp::Ordering::Equal
        }
        (IpAddr::V6(base), IpAddr::V6(addr)) => {
            bit_prefix_cmp(&base.octets(), &addr.octets(), bits as usize)
                == std::cmp::Ordering::Equal
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn host_port_split() {
        assert_eq!(
            split_host_port("192.0.2.1#53").unwrap(),
            ("192.0.2.1".to_string(), Some(53))
        );
        assert_eq!(
            split_host_port("2001:db8::1@8053").unwrap(),
            ("2001:db8::1".to_string(), Some(8053))
        );
        assert_eq!(
            split_host_port("192.0.2.1").unwrap(),
            ("192.0.2.1".to_string(), None)
        );
        // empty, zero and oversized ports are refused
        assert!(split_host_port("192.0.2.1#").is_err());
        assert!(split_host_port("192.0.2.1#0").is_err());
        assert!(split_host_port("192.0.2.1#65536").is_err());
        assert!(split_host_port("192.0.2.1#5x3").is_err());
    }

    #[test]
    fn join_renders_hash_form() {
        assert_eq!(join_host_port("192.0.2.1".parse().unwrap(), 53), "192.0.2.1#53");
    }

    #[test]
    fn socket_addr_with_default_port() {
        let addr = parse_socket_addr("192.0.2.1", 53).unwrap();
        assert_eq!(addr.port(), 53);
        let addr = parse_socket_addr("192.0.2.1@8053", 53).unwrap();
        assert_eq!(addr.port(), 8053);
    }

    #[test]
    fn set_port_touches_only_its_family() {
        let mut v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        set_port(&mut v4, 5353);
        assert_eq!(v4.port(), 5353);
        assert!(v4.is_ipv4());

        let mut v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        set_port(&mut v6, 5353);
        assert_eq!(v6.port(), 5353);
        assert!(v6.is_ipv6());
    }

    #[test]
    fn subnet_parsing_bounds() {
        assert_eq!(
            parse_subnet("192.0.2.0/24").unwrap(),
            ("192.0.2.0".parse().unwrap(), 24)
        );
        assert_eq!(
            parse_subnet("2001:db8::/48").unwrap(),
            ("2001:db8::".parse().unwrap(), 48)
        );
        // no suffix means host-length
        assert_eq!(parse_subnet("192.0.2.1").unwrap().1, 32);
        assert_eq!(parse_subnet("2001:db8::1").unwrap().1, 128);
        assert!(parse_subnet("192.0.2.0/33").is_err());
        assert!(parse_subnet("2001:db8::/129").is_err());
        assert!(parse_subnet("not-an-addr/8").is_err());
    }

    #[test]
    fn bit_prefix_comparison() {
        assert_eq!(bit_prefix_cmp(&[0xC0, 0x00], &[0xC0, 0xFF], 8), Ordering::Equal);
        assert_eq!(bit_prefix_cmp(&[0b1010_0000], &[0b1011_0000], 3), Ordering::Equal);
        assert_eq!(bit_prefix_cmp(&[0b1010_0000], &[0b1011_0000], 4), Ordering::Less);
    }

    #[test]
    fn subnet_membership() {
        let (base, bits) = parse_subnet("192.0.2.0/24").unwrap();
        assert!(subnet_contains(base, bits, "192.0.2.200".parse().unwrap()));
        assert!(!subnet_contains(base, bits, "192.0.3.1".parse().unwrap()));
        // families never match each other
        assert!(!subnet_contains(base, bits, "2001:db8::1".parse().unwrap()));
    }
}
