//! Client IP extraction from HTTP headers with trust validation
//!
//! Walks proxy chains right to left: hops matching the trusted proxy
//! configuration are skipped, and the first untrusted address is taken as
//! the client. Falls back to the socket remote address when headers are
//! absent or untrusted.

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{AnalyticsConfig, TrustedProxyMode};

/// Extract the client IP address according to the trust configuration.
pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_addr: IpAddr,
    config: &AnalyticsConfig,
) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => {
            extract_standard_ip(headers, config).unwrap_or(socket_addr)
        }
        TrustedProxyMode::None => socket_addr,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<IpAddr>().ok())
}

/// Standard headers: RFC 7239 Forwarded takes precedence, then
/// X-Forwarded-For. Both run through the same trust walk.
fn extract_standard_ip(headers: &HeaderMap, config: &AnalyticsConfig) -> Option<IpAddr> {
    if let Some(ip) = select_client_ip(&forwarded_chain(headers), config) {
        return Some(ip);
    }
    select_client_ip(&x_forwarded_for_chain(headers), config)
}

/// Parse the `for=` parameters out of an RFC 7239 Forwarded header, in
/// chain order (closest to the client first).
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let Some(forwarded) = headers.get("forwarded").and_then(|h| h.to_str().ok()) else {
        return Vec::new();
    };

    let mut ips = Vec::new();
    for element in forwarded.split(',') {
        for param in element.split(';') {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("for=") {
                // Strip quotes, brackets and port: for="[2001:db8::1]:4711"
                let unquoted = value.trim_matches('"');
                let ip_str = if let Some(rest) = unquoted.strip_prefix('[') {
                    rest.split(']').next().unwrap_or(rest)
                } else {
                    unquoted.split(':').next().unwrap_or(unquoted)
                };
                if let Ok(ip) = ip_str.parse::<IpAddr>() {
                    ips.push(ip);
                }
            }
        }
    }
    ips
}

fn x_forwarded_for_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .map(|xff| {
            xff.split(',')
                .filter_map(|s| s.trim().parse::<IpAddr>().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Pick the client address from a proxy chain.
///
/// With `num_trusted_proxies` set, that many hops are skipped from the
/// right. With a `trusted_proxies` CIDR list, hops matching any range are
/// skipped from the right and the first non-matching address wins. With no
/// trust configuration the rightmost address is used.
fn select_client_ip(ips: &[IpAddr], config: &AnalyticsConfig) -> Option<IpAddr> {
    if ips.is_empty() {
        return None;
    }

    if let Some(num_trusted) = config.num_trusted_proxies {
        if ips.len() > num_trusted {
            return Some(ips[ips.len() - num_trusted - 1]);
        }
        // Chain shorter than the trusted hop count, take the leftmost.
        return ips.first().copied();
    }

    if !config.trusted_proxies.is_empty() {
        let nets = parse_trusted_nets(&config.trusted_proxies);
        for ip in ips.iter().rev() {
            if !nets.iter().any(|net| net.contains(ip)) {
                return Some(*ip);
            }
        }
        // Every hop is a trusted proxy, the leftmost is the best guess.
        return ips.first().copied();
    }

    ips.last().copied()
}

fn parse_trusted_nets(ranges: &[String]) -> Vec<IpNet> {
    ranges
        .iter()
        .filter_map(|s| {
            // Accept both CIDR notation and bare addresses.
            s.parse::<IpNet>()
                .ok()
                .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
                .or_else(|| {
                    warn!(range = %s, "ignoring unparseable trusted proxy range");
                    None
                })
        })
        .collect()
}

/// Anonymize an IP address by truncating to its network prefix:
/// IPv4 to /24, IPv6 to /48.
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let octets = addr.octets();
            IpAddr::V4(std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], 0))
        }
        IpAddr::V6(addr) => {
            let segments = addr.segments();
            IpAddr::V6(std::net::Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                0,
                0,
                0,
                0,
                0,
            ))
        }
    }
}
