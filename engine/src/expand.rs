//! Expansion of group topologies and connections into directional peer
//! intents.
//!
//! Everything here is deterministic: member sets iterate alphabetically,
//! chains in document order, connections top to bottom. Edges never imply
//! their reverse; whoever wants symmetry emits both directions.

use wgtopo_shared::{
    Connection, ConnectionType, EndpointRef, Error, Group, GroupTopology, IntentOrigin, Network,
    Node, NodeName, PeerIntent, RouteToken, RoutingRule, TopologyInput,
};

/// Turns the topology input into the flat intent list plus the routing
/// rules the resolver applies later. Expansion of a single connection
/// stops at its first problem, but all connections are attempted so the
/// report covers the whole document.
pub fn expand(
    network: &Network,
    input: &TopologyInput,
) -> Result<(Vec<PeerIntent>, Vec<RoutingRule>), Vec<Error>> {
    let mut errors = Vec::new();
    let mut intents = Vec::new();

    for group in network.groups() {
        expand_group(network, group, &mut intents);
    }

    for connection in &input.connections {
        if let Err(e) = expand_connection(network, connection, &mut intents) {
            errors.push(e);
        }
    }

    // Explicit peers come last so the merge rule lets them override what
    // group expansion produced for the same pair.
    intents.extend(input.intents.iter().cloned());

    if errors.is_empty() {
        log::debug!("expanded {} intents", intents.len());
        Ok((intents, input.rules.clone()))
    } else {
        Err(errors)
    }
}

fn expand_group(network: &Network, group: &Group, intents: &mut Vec<PeerIntent>) {
    match group.topology {
        GroupTopology::Mesh => {
            let members = sorted_members(group);
            for a in &members {
                for b in &members {
                    if a != b {
                        intents.push(intra(network, group, a, b, IntentOrigin::GroupMesh));
                    }
                }
            }
        },
        GroupTopology::Star => {
            let hub = group.hub.as_ref().expect("star hub was validated");
            for member in &sorted_members(group) {
                if *member != hub {
                    intents.push(intra(network, group, member, hub, IntentOrigin::GroupStar));
                    intents.push(intra(network, group, hub, member, IntentOrigin::GroupStar));
                }
            }
        },
        GroupTopology::Chain => {
            for pair in group.members.windows(2) {
                intents.push(intra(network, group, &pair[0], &pair[1], IntentOrigin::GroupChain));
                intents.push(intra(network, group, &pair[1], &pair[0], IntentOrigin::GroupChain));
            }
        },
        GroupTopology::Single => {},
    }
}

fn sorted_members(group: &Group) -> Vec<&NodeName> {
    let mut members: Vec<&NodeName> = group.members.iter().collect();
    members.sort();
    members
}

fn intra(
    network: &Network,
    group: &Group,
    from: &NodeName,
    to: &NodeName,
    origin: IntentOrigin,
) -> PeerIntent {
    PeerIntent {
        from: from.clone(),
        to: to.clone(),
        endpoint: named_ref(network, group.mesh_endpoint.as_deref(), to),
        allowed_ips: Vec::new(),
        persistent_keepalive: None,
        origin,
        is_bridge: false,
    }
}

/// A named endpoint selector only applies to targets that expose endpoints
/// at all; a NAT-bound member without any stays passive instead of failing
/// the lookup.
fn named_ref(network: &Network, name: Option<&str>, target: &NodeName) -> Option<EndpointRef> {
    let name = name?;
    let target = network.node(target)?;
    if target.endpoints.is_empty() {
        None
    } else {
        Some(EndpointRef::Named(name.to_string()))
    }
}

fn expand_connection(
    network: &Network,
    conn: &Connection,
    intents: &mut Vec<PeerIntent>,
) -> Result<(), Error> {
    let unknown = |name: &str| Error::UnknownReference {
        name: name.to_string(),
        context: format!("connection {:?}", conn.name),
    };
    let from_members = network
        .side_members(&conn.from)
        .ok_or_else(|| unknown(&conn.from))?;
    let to_members = network
        .side_members(&conn.to)
        .ok_or_else(|| unknown(&conn.to))?;

    match conn.kind {
        ConnectionType::OutboundOnly => {
            for s in &from_members {
                for t in &to_members {
                    if s.name != t.name {
                        intents.push(edge(network, conn, s, t, IntentOrigin::GroupOutbound));
                    }
                }
            }
        },
        ConnectionType::Bidirectional => {
            both_ways(network, conn, &from_members, &to_members, IntentOrigin::GroupBidirectional, intents);
        },
        ConnectionType::FullMesh => {
            if conn.from == conn.to {
                // The cartesian product already visits each ordered pair.
                for s in &from_members {
                    for t in &to_members {
                        if s.name != t.name {
                            intents.push(edge(network, conn, s, t, IntentOrigin::GroupFullmesh));
                        }
                    }
                }
            } else {
                both_ways(network, conn, &from_members, &to_members, IntentOrigin::GroupFullmesh, intents);
            }
        },
        ConnectionType::Selective => {
            let from_members = restrict(&from_members, &conn.nodes);
            let to_members = restrict(&to_members, &conn.nodes);
            both_ways(network, conn, &from_members, &to_members, IntentOrigin::GroupSelective, intents);
        },
        ConnectionType::Gateway => expand_gateway(network, conn, &from_members, &to_members, intents)?,
        ConnectionType::Bridge => expand_bridge(network, conn, &from_members, &to_members, intents)?,
    }
    Ok(())
}

fn both_ways(
    network: &Network,
    conn: &Connection,
    from_members: &[&Node],
    to_members: &[&Node],
    origin: IntentOrigin,
    intents: &mut Vec<PeerIntent>,
) {
    for s in from_members {
        for t in to_members {
            if s.name != t.name {
                intents.push(edge(network, conn, s, t, origin));
                intents.push(edge(network, conn, t, s, origin));
            }
        }
    }
}

fn restrict<'a>(members: &[&'a Node], listed: &[NodeName]) -> Vec<&'a Node> {
    let picked: Vec<&Node> = members
        .iter()
        .filter(|n| listed.contains(&n.name))
        .copied()
        .collect();
    if picked.is_empty() {
        members.to_vec()
    } else {
        picked
    }
}

/// Gateway traffic funnels through `to_gw` (and `from_gw` when given):
/// clients carry the far side's subnet toward their gateway, and the
/// gateway pair carries both subnets across the trunk.
fn expand_gateway(
    network: &Network,
    conn: &Connection,
    from_members: &[&Node],
    to_members: &[&Node],
    intents: &mut Vec<PeerIntent>,
) -> Result<(), Error> {
    let unknown = |name: &NodeName| Error::UnknownReference {
        name: name.to_string(),
        context: format!("connection {:?}", conn.name),
    };
    let to_gw_name = conn.to_gw.as_ref().ok_or_else(|| Error::InvalidDocument {
        reason: format!("gateway connection {:?} needs `to_gw`", conn.name),
    })?;
    let to_gw = to_members
        .iter()
        .find(|n| &n.name == to_gw_name)
        .ok_or_else(|| unknown(to_gw_name))?;

    let to_hint = subnet_token(network, &conn.to);
    let from_hint = subnet_token(network, &conn.from);

    match &conn.from_gw {
        None => {
            for s in from_members {
                if s.name != to_gw.name {
                    intents.push(hinted(edge(network, conn, s, to_gw, IntentOrigin::GroupGateway), &to_hint));
                }
            }
        },
        Some(from_gw_name) => {
            let from_gw = from_members
                .iter()
                .find(|n| &n.name == from_gw_name)
                .ok_or_else(|| unknown(from_gw_name))?;
            for s in from_members {
                if s.name != from_gw.name {
                    intents.push(hinted(edge(network, conn, s, from_gw, IntentOrigin::GroupGateway), &to_hint));
                }
            }
            intents.push(hinted(edge(network, conn, from_gw, to_gw, IntentOrigin::GroupGateway), &to_hint));
            intents.push(hinted(edge(network, conn, to_gw, from_gw, IntentOrigin::GroupGateway), &from_hint));
            for t in to_members {
                if t.name != to_gw.name {
                    intents.push(hinted(edge(network, conn, t, to_gw, IntentOrigin::GroupGateway), &from_hint));
                }
            }
        },
    }
    Ok(())
}

fn subnet_token(network: &Network, side: &str) -> Option<RouteToken> {
    network.group(side).map(|g| RouteToken::Symbolic {
        scope: g.name.clone(),
        attr: "subnet".to_string(),
    })
}

fn hinted(mut intent: PeerIntent, hint: &Option<RouteToken>) -> PeerIntent {
    if let Some(token) = hint {
        if !intent.allowed_ips.contains(token) {
            intent.allowed_ips.push(token.clone());
        }
    }
    intent
}

/// A bridge joins exactly one node on each side, with a dedicated endpoint
/// per direction; the target's default endpoint is deliberately ignored.
fn expand_bridge(
    network: &Network,
    conn: &Connection,
    from_members: &[&Node],
    to_members: &[&Node],
    intents: &mut Vec<PeerIntent>,
) -> Result<(), Error> {
    let single = |members: &[&Node], side: &str| -> Result<NodeName, Error> {
        match members {
            [only] => Ok(only.name.clone()),
            _ => Err(Error::TopologyArity {
                group: conn.name.clone(),
                reason: format!(
                    "bridge side {side:?} must resolve to exactly one node, has {}",
                    members.len()
                ),
            }),
        }
    };
    let a = single(from_members, &conn.from)?;
    let b = single(to_members, &conn.to)?;

    for (from, to) in [(&a, &b), (&b, &a)] {
        let direction = format!("{from}_to_{to}");
        let endpoint = conn.endpoint_mapping.get(&direction).cloned().ok_or_else(|| {
            Error::BridgeMappingMissing {
                connection: conn.name.clone(),
                direction: direction.clone(),
            }
        })?;
        let from_node = network.node(from).expect("bridge sides resolved above");
        let to_node = network.node(to).expect("bridge sides resolved above");
        let mut intent = edge(network, conn, from_node, to_node, IntentOrigin::GroupBridge);
        intent.endpoint = Some(endpoint);
        intent.is_bridge = true;
        intents.push(intent);
    }
    Ok(())
}

fn edge(
    network: &Network,
    conn: &Connection,
    from: &Node,
    to: &Node,
    origin: IntentOrigin,
) -> PeerIntent {
    let mut allowed_ips = conn.allowed_ips.clone();
    for (side, routes) in &conn.side_allowed_ips {
        if network.subject_covers(side, &from.name) {
            allowed_ips.extend(routes.iter().cloned());
        }
    }
    PeerIntent {
        from: from.name.clone(),
        to: to.name.clone(),
        endpoint: named_ref(network, conn.endpoint.as_deref(), &to.name),
        allowed_ips,
        persistent_keepalive: conn.persistent_keepalive,
        origin,
        is_bridge: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgtopo_shared::Document;
    use indoc::indoc;

    fn model(toml: &str) -> (Network, TopologyInput) {
        Document::from_toml_str(toml).unwrap().into_model().unwrap()
    }

    #[test]
    fn mesh_emits_all_ordered_pairs() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            m = [
              { name = "c", wireguard_ip = "10.0.0.3/24" },
              { name = "a", wireguard_ip = "10.0.0.1/24" },
              { name = "b", wireguard_ip = "10.0.0.2/24" },
            ]
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        assert_eq!(intents.len(), 6);
        // Alphabetical iteration regardless of document order.
        assert_eq!(intents[0].from.as_str(), "a");
        assert_eq!(intents[0].to.as_str(), "b");
        assert!(intents.iter().all(|i| i.origin == IntentOrigin::GroupMesh));
    }

    #[test]
    fn star_emits_both_directions_per_member() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            s = [
              { name = "hub", wireguard_ip = "10.0.0.1/24", endpoint = "5.5.5.5:51820" },
              { name = "m1", wireguard_ip = "10.0.0.2/24" },
              { name = "m2", wireguard_ip = "10.0.0.3/24" },
            ]

            [[groups]]
            name = "s"
            topology = "star"
            hub = "hub"
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        assert_eq!(intents.len(), 4);
        let to_hub = intents
            .iter()
            .filter(|i| i.to.as_str() == "hub")
            .count();
        assert_eq!(to_hub, 2);
    }

    #[test]
    fn chain_links_adjacent_members_in_document_order() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            c = [
              { name = "z", wireguard_ip = "10.0.0.1/24" },
              { name = "a", wireguard_ip = "10.0.0.2/24" },
              { name = "k", wireguard_ip = "10.0.0.3/24" },
            ]

            [[groups]]
            name = "c"
            topology = "chain"
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        assert_eq!(intents.len(), 4);
        assert_eq!(
            (intents[0].from.as_str(), intents[0].to.as_str()),
            ("z", "a")
        );
        assert_eq!(
            (intents[2].from.as_str(), intents[2].to.as_str()),
            ("a", "k")
        );
        // No edge between the chain's ends.
        assert!(!intents
            .iter()
            .any(|i| i.from.as_str() == "z" && i.to.as_str() == "k"));
    }

    #[test]
    fn outbound_only_never_emits_reverse() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            office = [
              { name = "a", wireguard_ip = "10.0.0.1/24" },
              { name = "b", wireguard_ip = "10.0.0.2/24" },
            ]
            relay = [{ name = "r", wireguard_ip = "10.0.1.1/24", endpoint = "9.9.9.9:51820" }]

            [[groups]]
            from = "office"
            to = "relay"
            type = "outbound_only"
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        let outbound: Vec<_> = intents
            .iter()
            .filter(|i| i.origin == IntentOrigin::GroupOutbound)
            .collect();
        assert_eq!(outbound.len(), 2);
        assert!(outbound.iter().all(|i| i.to.as_str() == "r"));
    }

    #[test]
    fn selective_restricts_the_listed_side() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            office = [
              { name = "a", wireguard_ip = "10.0.0.1/24" },
              { name = "b", wireguard_ip = "10.0.0.2/24" },
              { name = "c", wireguard_ip = "10.0.0.3/24" },
            ]
            lab = [{ name = "x", wireguard_ip = "10.0.1.1/24" }]

            [[groups]]
            from = "office"
            to = "lab"
            type = "selective"
            nodes = ["a", "b"]
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        let selective: Vec<_> = intents
            .iter()
            .filter(|i| i.origin == IntentOrigin::GroupSelective)
            .collect();
        assert_eq!(selective.len(), 4);
        assert!(!selective
            .iter()
            .any(|i| i.from.as_str() == "c" || i.to.as_str() == "c"));
    }

    #[test]
    fn gateway_funnels_through_to_gw() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            office = [
              { name = "a", wireguard_ip = "10.0.0.1/24" },
              { name = "b", wireguard_ip = "10.0.0.2/24" },
            ]
            dc = [
              { name = "gw", wireguard_ip = "10.0.1.1/24", role = "relay", endpoint = "9.9.9.9:51820" },
              { name = "db", wireguard_ip = "10.0.1.2/24" },
            ]

            [[groups]]
            from = "office"
            to = "dc"
            type = "gateway"
            to_gw = "gw"
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        let gateway: Vec<_> = intents
            .iter()
            .filter(|i| i.origin == IntentOrigin::GroupGateway)
            .collect();
        assert_eq!(gateway.len(), 2);
        assert!(gateway.iter().all(|i| i.to.as_str() == "gw"));
        assert!(gateway.iter().all(|i| i
            .allowed_ips
            .contains(&"dc.subnet".parse().unwrap())));
    }

    #[test]
    fn bridge_uses_the_mapping_per_direction() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            left = [{ name = "g", wireguard_ip = "10.0.0.1/24", endpoints = { special = "10.10.10.10:22222" } }]
            right = [{ name = "h", wireguard_ip = "10.0.0.2/24", endpoints = { special = "172.16.1.1:33333" } }]

            [[groups]]
            from = "left"
            to = "right"
            type = "bridge"
            endpoint_mapping = { g_to_h = "special", h_to_g = "special" }
        "#});
        let (intents, _) = expand(&network, &input).unwrap();
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| i.is_bridge));
        assert!(intents
            .iter()
            .all(|i| matches!(i.endpoint, Some(EndpointRef::Named(ref n)) if n == "special")));
    }

    #[test]
    fn bridge_without_mapping_fails() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            left = [{ name = "g", wireguard_ip = "10.0.0.1/24" }]
            right = [{ name = "h", wireguard_ip = "10.0.0.2/24" }]

            [[groups]]
            from = "left"
            to = "right"
            type = "bridge"
            endpoint_mapping = { g_to_h = "1.2.3.4:51820" }
        "#});
        let errors = expand(&network, &input).unwrap_err();
        assert!(matches!(
            &errors[0],
            Error::BridgeMappingMissing { direction, .. } if direction == "h_to_g"
        ));
    }

    #[test]
    fn unknown_connection_side_is_reported() {
        let (network, input) = model(indoc! {r#"
            [nodes]
            office = [
              { name = "a", wireguard_ip = "10.0.0.1/24" },
              { name = "b", wireguard_ip = "10.0.0.2/24" },
            ]

            [[groups]]
            from = "office"
            to = "nowhere"
            type = "bidirectional"
        "#});
        let errors = expand(&network, &input).unwrap_err();
        assert!(matches!(
            &errors[0],
            Error::UnknownReference { name, .. } if name == "nowhere"
        ));
    }
}
