use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};

// IP and MAC helpers shared by the engine, the daemon and the plugin

/// Locally administered prefix used when a MAC is derived from an IPv4 address
pub const PRIVATE_MAC_PREFIX: [u8; 2] = [0x0a, 0x58];

/// Reduce an address to its 4-byte form.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are accepted; any other IPv6
/// address has no 4-byte form and yields `None`.
pub fn to_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Complete a partially specified gateway from the subnet's network address.
///
/// Leading zero octets of `gateway` are taken from the network address, so
/// `0.0.0.5` in `10.1.2.0/24` becomes `10.1.2.5` and `0.0.3.1` in
/// `10.1.0.0/16` becomes `10.1.3.1`. A gateway without leading zeros is
/// returned unchanged.
///
/// # Examples
/// ```
/// use ipamd::utils::ip_utils::complete_gateway;
///
/// let subnet = "10.1.2.0/24".parse().unwrap();
/// assert_eq!(complete_gateway("0.0.0.5".parse().unwrap(), subnet).to_string(), "10.1.2.5");
/// assert_eq!(complete_gateway("10.1.2.9".parse().unwrap(), subnet).to_string(), "10.1.2.9");
/// ```
pub fn complete_gateway(gateway: Ipv4Addr, subnet: Ipv4Net) -> Ipv4Addr {
    let gw = gateway.octets();
    let Some(first_set) = gw.iter().position(|&octet| octet != 0) else {
        return gateway;
    };
    let mut octets = subnet.network().octets();
    octets[first_set..].copy_from_slice(&gw[first_set..]);
    Ipv4Addr::from(octets)
}

/// Derive a MAC from an IPv4 address: `0a:58` followed by the four octets
pub fn mac_from_ipv4(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format_mac(&[PRIVATE_MAC_PREFIX[0], PRIVATE_MAC_PREFIX[1], o[0], o[1], o[2], o[3]])
}

/// Format six bytes as a lowercase colon-separated MAC
pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse and normalise a colon- or dash-separated MAC address
pub fn parse_mac(mac: &str) -> Option<String> {
    let bytes: Vec<u8> = mac
        .trim()
        .split(|c: char| c == ':' || c == '-')
        .map(|part| {
            if part.len() == 2 {
                u8::from_str_radix(part, 16).ok()
            } else {
                None
            }
        })
        .collect::<Option<Vec<u8>>>()?;

    let bytes: [u8; 6] = bytes.try_into().ok()?;
    Some(format_mac(&bytes))
}
