//! CIDR predicates and list canonicalization.
//!
//! Everything here is a pure function over `ipnet` values; parsing of the
//! textual forms lives with the types that own them.

use std::cmp::Reverse;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::Error;

/// Host-route prefix for the address family.
pub fn host_prefix(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() {
        32
    } else {
        128
    }
}

/// The /32 (or /128) network containing exactly `addr`.
pub fn host_route(addr: IpAddr) -> IpNet {
    IpNet::new(addr, host_prefix(&addr)).expect("host prefix always fits")
}

/// True when `outer` covers every address of `inner`. Mixed families never
/// contain each other.
pub fn cidr_contains(outer: &IpNet, inner: &IpNet) -> bool {
    outer.contains(inner)
}

/// True when the two networks share at least one address.
pub fn cidrs_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn family_rank(net: &IpNet) -> u8 {
    match net {
        IpNet::V4(_) => 0,
        IpNet::V6(_) => 1,
    }
}

/// Deduplicate, drop entries strictly contained by another entry, and sort
/// by (family, prefix length descending, network address) so equal inputs
/// always produce byte-identical lists.
pub fn canonicalize(nets: Vec<IpNet>) -> Vec<IpNet> {
    let mut nets: Vec<IpNet> = nets.into_iter().map(|n| n.trunc()).collect();
    nets.sort_by_key(|n| (family_rank(n), Reverse(n.prefix_len()), n.network()));
    nets.dedup();

    let kept: Vec<IpNet> = nets
        .iter()
        .filter(|n| {
            !nets
                .iter()
                .any(|m| m != *n && cidr_contains(m, n))
        })
        .cloned()
        .collect();
    kept
}

/// Smallest network covering all the given addresses, computed per address
/// family. An empty input produces an empty result.
pub fn covering_nets(addrs: &[IpAddr]) -> Vec<IpNet> {
    let mut nets = Vec::new();
    for family in [true, false] {
        let members: Vec<IpAddr> = addrs
            .iter()
            .filter(|a| a.is_ipv4() == family)
            .cloned()
            .collect();
        if let Some(net) = covering_net_one_family(&members) {
            nets.push(net);
        }
    }
    nets
}

fn covering_net_one_family(addrs: &[IpAddr]) -> Option<IpNet> {
    let first = addrs.first()?;
    let mut net = host_route(*first);
    for addr in &addrs[1..] {
        while !net.contains(addr) {
            net = net.supernet().expect("widening stops at /0 which contains everything");
        }
    }
    Some(net.trunc())
}

/// Parse a route-position CIDR. A bare address is accepted as a host route;
/// anything else is an [`Error::InvalidAddress`].
pub fn parse_route_cidr(s: &str) -> Result<IpNet, Error> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Ok(host_route(addr));
    }
    Err(Error::InvalidAddress {
        given: s.to_string(),
    })
}

/// Parse an interface address: an address *with* prefix length. A bare
/// address gets the host prefix rather than being rejected.
pub fn parse_interface_address(s: &str) -> Result<IpNet, Error> {
    parse_route_cidr(s)
}

pub fn is_default_route(net: &IpNet) -> bool {
    net.prefix_len() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn host_routes() {
        assert_eq!(host_route("10.0.0.1".parse().unwrap()), net("10.0.0.1/32"));
        assert_eq!(host_route("fd00::1".parse().unwrap()), net("fd00::1/128"));
    }

    #[test]
    fn containment_and_overlap() {
        assert!(cidr_contains(&net("10.96.0.0/16"), &net("10.96.1.0/24")));
        assert!(!cidr_contains(&net("10.96.1.0/24"), &net("10.96.0.0/16")));
        assert!(cidrs_overlap(&net("10.96.0.0/16"), &net("10.96.3.7/32")));
        assert!(!cidrs_overlap(&net("10.96.0.0/16"), &net("10.97.0.0/16")));
        // Families never overlap.
        assert!(!cidrs_overlap(&net("0.0.0.0/0"), &net("::/0")));
    }

    #[test]
    fn canonicalize_dedupes_and_drops_contained() {
        let out = canonicalize(vec![
            net("10.96.0.0/16"),
            net("10.96.0.3/32"),
            net("10.96.0.0/16"),
            net("192.168.1.0/24"),
        ]);
        assert_eq!(out, vec![net("192.168.1.0/24"), net("10.96.0.0/16")]);
    }

    #[test]
    fn canonicalize_orders_specific_first() {
        let out = canonicalize(vec![
            net("fd00::/64"),
            net("10.0.0.0/8"),
            net("10.96.0.3/32"),
            net("172.16.0.1/32"),
        ]);
        assert_eq!(
            out,
            vec![
                net("10.96.0.3/32"),
                net("172.16.0.1/32"),
                net("10.0.0.0/8"),
                net("fd00::/64"),
            ]
        );
    }

    #[test]
    fn canonicalize_truncates_host_bits() {
        assert_eq!(canonicalize(vec![net("10.96.0.3/16")]), vec![net("10.96.0.0/16")]);
    }

    #[test]
    fn covering_net_of_scattered_hosts() {
        let addrs: Vec<IpAddr> = ["10.96.0.2", "10.96.0.3", "10.96.0.4"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(covering_nets(&addrs), vec![net("10.96.0.0/29")]);
    }

    #[test]
    fn covering_net_spans_families() {
        let addrs: Vec<IpAddr> = ["10.1.0.1", "10.2.0.1", "fd00::1", "fd00::2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let nets = covering_nets(&addrs);
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains(&"10.1.0.1".parse::<IpAddr>().unwrap()));
        assert!(nets[0].contains(&"10.2.0.1".parse::<IpAddr>().unwrap()));
        assert!(nets[1].contains(&"fd00::2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn route_parsing() {
        assert_eq!(parse_route_cidr("10.96.0.0/16").unwrap(), net("10.96.0.0/16"));
        assert_eq!(parse_route_cidr("10.96.0.3").unwrap(), net("10.96.0.3/32"));
        assert!(matches!(
            parse_route_cidr("not-an-address"),
            Err(Error::InvalidAddress { .. })
        ));
    }
}
