//! Symbolic route expansion and the per-node allowed-ips discipline.
//!
//! Within one node's peer list the allowed-ips partition reachable address
//! space: any overlap between two peers is fatal, with a single exception
//! mirroring kernel longest-prefix matching. When one peer's set strictly
//! contains another peer's set and carries that peer's own host route as a
//! list element, the host route is dropped from the wider set and the more
//! specific peer wins.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;

use wgtopo_shared::address::{
    canonicalize, cidr_contains, cidrs_overlap, covering_nets, is_default_route,
};
use wgtopo_shared::{Diagnostic, Endpoint, Error, IntentOrigin, Network, NodeName, RouteToken, RoutingRule};

use crate::peer_map::PeerMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolvedPeer {
    pub peer: NodeName,
    pub endpoint: Option<Endpoint>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
    pub origin: IntentOrigin,
    pub is_bridge: bool,
    pub synthesized: bool,
}

impl ResolvedPeer {
    /// A peer block without an endpoint only accepts incoming handshakes.
    pub fn is_passive(&self) -> bool {
        self.endpoint.is_none()
    }
}

pub type ResolvedMap = BTreeMap<NodeName, Vec<ResolvedPeer>>;

pub fn resolve(
    network: &Network,
    map: &PeerMap,
    rules: &[RoutingRule],
) -> Result<(ResolvedMap, Vec<Diagnostic>), Vec<Error>> {
    let mut errors = Vec::new();
    let mut diagnostics = Vec::new();
    let mut resolved: ResolvedMap = BTreeMap::new();

    for (node, drafts) in map {
        let mut peers = Vec::new();
        for draft in drafts {
            let mut tokens = draft.tokens.clone();
            // Free-standing rules route traffic *toward* their subject.
            for rule in rules {
                if network.subject_covers(&rule.subject, &draft.peer) {
                    tokens.extend(rule.routes.iter().cloned());
                }
            }

            let mut nets = Vec::new();
            for token in &tokens {
                match expand_token(network, token) {
                    Ok(mut expanded) => nets.append(&mut expanded),
                    Err(e) => errors.push(e),
                }
            }
            let mut nets = canonicalize(nets);

            let target = network.node(&draft.peer).expect("peer map is validated");
            let host = target.host_route();
            if !nets.iter().any(|net| cidr_contains(net, &host)) {
                nets.push(host);
                nets = canonicalize(nets);
            }

            if draft.mixed_origin {
                diagnostics.push(Diagnostic::MixedOriginMerge {
                    node: node.to_string(),
                    peer: draft.peer.to_string(),
                });
            }

            peers.push(ResolvedPeer {
                peer: draft.peer.clone(),
                endpoint: draft.endpoint.clone(),
                allowed_ips: nets,
                persistent_keepalive: draft.persistent_keepalive,
                origin: draft.origin,
                is_bridge: draft.is_bridge,
                synthesized: draft.synthesized,
            });
        }

        reconcile_host_routes(network, &mut peers);
        check_overlaps(node, &peers, &mut errors);
        peer_diagnostics(network, node, &peers, &mut diagnostics);

        resolved.insert(node.clone(), peers);
    }

    // Nodes nothing dials still get a record (interface block, no peers).
    for node in network.nodes() {
        resolved.entry(node.name.clone()).or_default();
    }

    if errors.is_empty() {
        Ok((resolved, diagnostics))
    } else {
        Err(errors)
    }
}

fn expand_token(network: &Network, token: &RouteToken) -> Result<Vec<IpNet>, Error> {
    match token {
        RouteToken::Cidr(net) => Ok(vec![*net]),
        RouteToken::Symbolic { scope, attr } => {
            if let Some(group) = network.group(scope) {
                let members: Vec<&NodeName> = group.members.iter().collect();
                match attr.as_str() {
                    "subnet" => {
                        let addrs: Vec<IpAddr> = members
                            .iter()
                            .filter_map(|m| network.node(m))
                            .map(|n| n.overlay_addr())
                            .collect();
                        Ok(covering_nets(&addrs))
                    },
                    "nodes" => Ok(members
                        .iter()
                        .filter_map(|m| network.node(m))
                        .map(|n| n.host_route())
                        .collect()),
                    _ => Err(Error::BadRouteToken {
                        token: token.to_string(),
                        reason: "group attribute must be `subnet` or `nodes`".to_string(),
                    }),
                }
            } else if network.node(scope).is_some() {
                Err(Error::BadRouteToken {
                    token: token.to_string(),
                    reason: "node endpoints are not routes".to_string(),
                })
            } else {
                Err(Error::UnknownReference {
                    name: scope.clone(),
                    context: "allowed_ips".to_string(),
                })
            }
        },
    }
}

/// The longest-prefix exception: drop another peer's host route from a set
/// that strictly contains that peer's whole list.
fn reconcile_host_routes(network: &Network, peers: &mut [ResolvedPeer]) {
    let hosts: Vec<IpNet> = peers
        .iter()
        .map(|p| {
            network
                .node(&p.peer)
                .expect("peer map is validated")
                .host_route()
        })
        .collect();

    for i in 0..peers.len() {
        for j in 0..peers.len() {
            if i == j {
                continue;
            }
            let host = hosts[j];
            if peers[i].allowed_ips.contains(&host)
                && is_strict_superset(&peers[i].allowed_ips, &peers[j].allowed_ips)
            {
                peers[i].allowed_ips.retain(|net| net != &host);
            }
        }
    }
}

fn is_strict_superset(a: &[IpNet], b: &[IpNet]) -> bool {
    a.len() > b.len() && b.iter().all(|net| a.contains(net))
}

fn check_overlaps(node: &NodeName, peers: &[ResolvedPeer], errors: &mut Vec<Error>) {
    for (i, p1) in peers.iter().enumerate() {
        for p2 in &peers[i + 1..] {
            let conflict = p1.allowed_ips.iter().find_map(|a| {
                p2.allowed_ips
                    .iter()
                    .find(|b| cidrs_overlap(a, b))
                    .map(|b| (*a, *b))
            });
            if let Some((cidr_a, cidr_b)) = conflict {
                errors.push(Error::AllowedIpsOverlap {
                    node: node.to_string(),
                    peer_a: p1.peer.to_string(),
                    peer_b: p2.peer.to_string(),
                    cidr_a,
                    cidr_b,
                });
            }
        }
    }
}

fn peer_diagnostics(
    network: &Network,
    node: &NodeName,
    peers: &[ResolvedPeer],
    diagnostics: &mut Vec<Diagnostic>,
) {
    for peer in peers {
        let has_default = peer.allowed_ips.iter().any(is_default_route);
        let has_other = peer.allowed_ips.iter().any(|net| !is_default_route(net));
        if has_default && has_other {
            diagnostics.push(Diagnostic::DefaultRouteMixed {
                node: node.to_string(),
                peer: peer.peer.to_string(),
            });
        }

        for net in &peer.allowed_ips {
            if !is_default_route(net) && net.prefix_len() < 16 {
                diagnostics.push(Diagnostic::BroadRoute {
                    node: node.to_string(),
                    peer: peer.peer.to_string(),
                    cidr: *net,
                });
            }
        }

        // A relay-path entry carrying nothing but the target's own host
        // route usually means its routing rule went missing.
        if matches!(
            peer.origin,
            IntentOrigin::GroupGateway | IntentOrigin::GroupBridge
        ) && !peer.synthesized
        {
            let target_host = network
                .node(&peer.peer)
                .expect("peer map is validated")
                .host_route();
            if peer.allowed_ips == [target_host] {
                diagnostics.push(Diagnostic::BareRelayRoute {
                    node: node.to_string(),
                    peer: peer.peer.to_string(),
                });
            }
        }
    }
}
