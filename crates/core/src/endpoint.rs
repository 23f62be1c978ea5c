//! Network endpoint normalization and classification

use std::net::{IpAddr, SocketAddr};

use beacon_schemas::EndpointScope;

/// Normalized endpoint natural key plus classification metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub address: String,
    pub ip_version: Option<i16>,
    pub scope: EndpointScope,
}

/// Normalize a source address
///
/// Accepts bare IPs, `ip:port` and `[ipv6]:port`. Parseable addresses are
/// rendered canonically (IPv4-mapped IPv6 collapses to IPv4). Anything else
/// is kept verbatim with scope `unknown`. Blank input yields `None`.
pub fn normalize_address(raw: &str) -> Option<EndpointKey> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = trimmed
        .parse::<IpAddr>()
        .ok()
        .or_else(|| trimmed.parse::<SocketAddr>().ok().map(|sa| sa.ip()))
        .or_else(|| {
            trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|inner| inner.parse::<IpAddr>().ok())
        });

    let Some(ip) = parsed else {
        return Some(EndpointKey {
            address: trimmed.to_string(),
            ip_version: None,
            scope: EndpointScope::Unknown,
        });
    };

    let ip = match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    Some(EndpointKey {
        address: ip.to_string(),
        ip_version: Some(if ip.is_ipv4() { 4 } else { 6 }),
        scope: classify(&ip),
    })
}

fn classify(ip: &IpAddr) -> EndpointScope {
    if ip.is_unspecified() {
        return EndpointScope::Unspecified;
    }
    if ip.is_loopback() {
        return EndpointScope::Loopback;
    }
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || is_shared_v4(v4.octets()) {
                EndpointScope::Private
            } else if v4.is_link_local() {
                EndpointScope::LinkLocal
            } else {
                EndpointScope::Public
            }
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if first & 0xfe00 == 0xfc00 {
                // fc00::/7 unique local
                EndpointScope::Private
            } else if first & 0xffc0 == 0xfe80 {
                EndpointScope::LinkLocal
            } else {
                EndpointScope::Public
            }
        }
    }
}

/// 100.64.0.0/10 carrier-grade NAT
fn is_shared_v4(octets: [u8; 4]) -> bool {
    octets[0] == 100 && (octets[1] & 0xc0) == 64
}
