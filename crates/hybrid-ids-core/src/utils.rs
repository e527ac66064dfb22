//! Address predicates and small helpers.

use std::collections::HashSet;
use std::net::IpAddr;

/// Ports treated as well-known service endpoints by the decision layer.
pub const COMMON_PORTS: [u16; 17] = [
    22, 23, 25, 53, 80, 110, 143, 443, 445, 587, 465, 993, 995, 3306, 3389, 8080, 8443,
];

pub fn is_common_port(port: u16) -> bool {
    COMMON_PORTS.contains(&port)
}

/// RFC1918 ranges, loopback included.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 127
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Addresses owned by this host: loopback, link-local, and every address
/// assigned to a local interface. Used to suppress self-inflicted alerts.
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut addrs: HashSet<IpAddr> = HashSet::new();
    addrs.insert(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    addrs.insert(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST));

    for iface in pnet::datalink::interfaces() {
        for network in &iface.ips {
            addrs.insert(network.ip());
        }
    }
    addrs
}

/// Format bytes into a human readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if size >= 100.0 {
        format!("{:.0} {}", size, UNITS[unit_index])
    } else if size >= 10.0 {
        format!("{:.1} {}", size, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
