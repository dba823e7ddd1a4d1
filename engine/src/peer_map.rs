//! From directional intents to per-node preliminary peer tables.
//!
//! The per-`from` grouping here is the source of truth for "what peers
//! does node X have"; the builder never mirrors an edge. The single
//! exception is the passive entry synthesized on a target that is dialed
//! but never dials back, which is what lets NAT-bound clients reach
//! relays that cannot reach them.

use std::collections::{BTreeMap, BTreeSet};

use wgtopo_shared::{
    Endpoint, EndpointRef, Error, IntentOrigin, Network, Node, NodeName, PeerIntent, RouteToken,
};

#[derive(Clone, Debug, PartialEq)]
pub struct PeerDraft {
    pub peer: NodeName,
    pub endpoint: Option<Endpoint>,
    /// Unresolved allowed-ips tokens; concatenated across merged intents.
    pub tokens: Vec<RouteToken>,
    pub persistent_keepalive: Option<u16>,
    pub origin: IntentOrigin,
    pub is_bridge: bool,
    /// True for passive entries that have no originating intent.
    pub synthesized: bool,
    /// True when intra-group and inter-group intents merged into this
    /// entry; surfaces as a diagnostic after resolution.
    pub mixed_origin: bool,
}

pub type PeerMap = BTreeMap<NodeName, Vec<PeerDraft>>;

fn is_intra(origin: IntentOrigin) -> bool {
    matches!(
        origin,
        IntentOrigin::GroupMesh | IntentOrigin::GroupStar | IntentOrigin::GroupChain
    )
}

pub fn build_peer_map(network: &Network, intents: &[PeerIntent]) -> Result<PeerMap, Vec<Error>> {
    let mut errors = Vec::new();

    let mut self_peers = BTreeSet::new();
    let mut unknown = BTreeSet::new();
    for intent in intents {
        if intent.from == intent.to {
            self_peers.insert(intent.from.clone());
        }
        for name in [&intent.from, &intent.to] {
            if network.node(name).is_none() {
                unknown.insert(name.clone());
            }
        }
    }
    errors.extend(self_peers.into_iter().map(|node| Error::SelfPeer {
        node: node.to_string(),
    }));
    errors.extend(unknown.into_iter().map(|name| Error::UnknownReference {
        name: name.to_string(),
        context: "peer list".to_string(),
    }));
    if !errors.is_empty() {
        return Err(errors);
    }

    let mut map: PeerMap = BTreeMap::new();
    let mut slots: BTreeMap<(NodeName, NodeName), usize> = BTreeMap::new();

    for intent in intents {
        let target = network.node(&intent.to).expect("references checked above");
        let endpoint = match resolve_endpoint(intent, target) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                errors.push(e);
                continue;
            },
        };

        let key = (intent.from.clone(), intent.to.clone());
        let drafts = map.entry(intent.from.clone()).or_default();
        match slots.get(&key) {
            Some(&slot) => {
                // Duplicate pair: the later intent wins for endpoint and
                // keepalive, allowed-ips concatenate.
                let draft = &mut drafts[slot];
                draft.mixed_origin |= is_intra(draft.origin) != is_intra(intent.origin);
                draft.endpoint = endpoint;
                draft.persistent_keepalive = intent.persistent_keepalive;
                draft.tokens.extend(intent.allowed_ips.iter().cloned());
                draft.origin = intent.origin;
                draft.is_bridge |= intent.is_bridge;
            },
            None => {
                slots.insert(key, drafts.len());
                drafts.push(PeerDraft {
                    peer: intent.to.clone(),
                    endpoint,
                    tokens: intent.allowed_ips.clone(),
                    persistent_keepalive: intent.persistent_keepalive,
                    origin: intent.origin,
                    is_bridge: intent.is_bridge,
                    synthesized: false,
                    mixed_origin: false,
                });
            },
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    synthesize_passive(&mut map, &slots);

    for drafts in map.values_mut() {
        drafts.sort_by(|a, b| {
            (a.origin.sort_class(), &a.peer).cmp(&(b.origin.sort_class(), &b.peer))
        });
    }

    Ok(map)
}

/// A passive entry appears on `to` for `from` only when from→to exists and
/// to→from does not. No endpoint, no keepalive; the resolver fills in the
/// dialer's host route.
fn synthesize_passive(map: &mut PeerMap, slots: &BTreeMap<(NodeName, NodeName), usize>) {
    let missing: Vec<(NodeName, NodeName)> = slots
        .keys()
        .filter(|(from, to)| !slots.contains_key(&(to.clone(), from.clone())))
        .cloned()
        .collect();

    for (from, to) in missing {
        let origin = map[&from][slots[&(from.clone(), to.clone())]].origin;
        map.entry(to).or_default().push(PeerDraft {
            peer: from,
            endpoint: None,
            tokens: Vec::new(),
            persistent_keepalive: None,
            origin,
            is_bridge: false,
            synthesized: true,
            mixed_origin: false,
        });
    }
}

fn resolve_endpoint(intent: &PeerIntent, target: &Node) -> Result<Option<Endpoint>, Error> {
    match &intent.endpoint {
        Some(EndpointRef::Literal(endpoint)) => Ok(Some(endpoint.clone())),
        Some(EndpointRef::Named(name)) => target
            .endpoints
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::EndpointNotFound {
                node: target.name.to_string(),
                endpoint: name.clone(),
                wanted_by: intent.from.to_string(),
            }),
        // Bridges never fall back to the target's default endpoint.
        None if intent.is_bridge => Ok(None),
        None => Ok(target.default_endpoint().cloned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use wgtopo_shared::Document;

    fn network(toml: &str) -> Network {
        let (network, _) = Document::from_toml_str(toml).unwrap().into_model().unwrap();
        network
    }

    fn intent(from: &str, to: &str) -> PeerIntent {
        PeerIntent {
            from: from.parse().unwrap(),
            to: to.parse().unwrap(),
            endpoint: None,
            allowed_ips: vec![],
            persistent_keepalive: None,
            origin: IntentOrigin::ExplicitTopology,
            is_bridge: false,
        }
    }

    const TWO_NODES: &str = indoc! {r#"
        [[nodes]]
        name = "a"
        wireguard_ip = "10.0.0.1/24"

        [[nodes]]
        name = "b"
        wireguard_ip = "10.0.0.2/24"
        endpoints = { main = "1.1.1.1:51820", alt = "2.2.2.2:51820" }
    "#};

    #[test]
    fn unset_ref_takes_lexicographically_first_endpoint() {
        let network = network(TWO_NODES);
        let map = build_peer_map(&network, &[intent("a", "b")]).unwrap();
        let draft = &map[&"a".parse().unwrap()][0];
        assert_eq!(draft.endpoint.as_ref().unwrap().to_string(), "2.2.2.2:51820");
    }

    #[test]
    fn named_ref_resolves_or_fails() {
        let network = network(TWO_NODES);

        let mut with_name = intent("a", "b");
        with_name.endpoint = Some(EndpointRef::Named("main".into()));
        let map = build_peer_map(&network, &[with_name]).unwrap();
        let draft = &map[&"a".parse().unwrap()][0];
        assert_eq!(draft.endpoint.as_ref().unwrap().to_string(), "1.1.1.1:51820");

        let mut missing = intent("a", "b");
        missing.endpoint = Some(EndpointRef::Named("nope".into()));
        let errors = build_peer_map(&network, &[missing]).unwrap_err();
        assert!(matches!(&errors[0], Error::EndpointNotFound { endpoint, .. } if endpoint == "nope"));
    }

    #[test]
    fn passive_entry_synthesized_only_without_reverse() {
        let network = network(TWO_NODES);

        let map = build_peer_map(&network, &[intent("a", "b")]).unwrap();
        let b_drafts = &map[&"b".parse().unwrap()];
        assert_eq!(b_drafts.len(), 1);
        assert!(b_drafts[0].synthesized);
        assert!(b_drafts[0].endpoint.is_none());
        assert!(b_drafts[0].persistent_keepalive.is_none());

        // With an explicit reverse intent, nothing is synthesized.
        let map = build_peer_map(&network, &[intent("a", "b"), intent("b", "a")]).unwrap();
        assert!(map[&"b".parse().unwrap()].iter().all(|d| !d.synthesized));
    }

    #[test]
    fn reverse_intent_is_never_mirrored() {
        let network = network(TWO_NODES);
        let mut forward = intent("a", "b");
        forward.persistent_keepalive = Some(25);
        forward.allowed_ips = vec!["10.0.0.0/24".parse().unwrap()];
        let map = build_peer_map(&network, &[forward, intent("b", "a")]).unwrap();

        let reverse = &map[&"b".parse().unwrap()][0];
        assert_eq!(reverse.persistent_keepalive, None);
        assert!(reverse.tokens.is_empty());
    }

    #[test]
    fn duplicate_pairs_merge_with_later_winning() {
        let network = network(TWO_NODES);
        let mut first = intent("a", "b");
        first.endpoint = Some(EndpointRef::Named("main".into()));
        first.allowed_ips = vec!["10.1.0.0/24".parse().unwrap()];
        let mut second = intent("a", "b");
        second.endpoint = Some(EndpointRef::Named("alt".into()));
        second.allowed_ips = vec!["10.2.0.0/24".parse().unwrap()];
        second.persistent_keepalive = Some(15);

        let map = build_peer_map(&network, &[first, second]).unwrap();
        let drafts = &map[&"a".parse().unwrap()];
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].endpoint.as_ref().unwrap().to_string(), "2.2.2.2:51820");
        assert_eq!(drafts[0].persistent_keepalive, Some(15));
        assert_eq!(drafts[0].tokens.len(), 2);
    }

    #[test]
    fn self_peer_is_rejected() {
        let network = network(TWO_NODES);
        let errors = build_peer_map(&network, &[intent("a", "a")]).unwrap_err();
        assert!(matches!(&errors[0], Error::SelfPeer { node } if node == "a"));
    }

    #[test]
    fn unknown_peer_reference_is_rejected() {
        let network = network(TWO_NODES);
        let errors = build_peer_map(&network, &[intent("a", "ghost")]).unwrap_err();
        assert!(matches!(&errors[0], Error::UnknownReference { .. }));
    }

    #[test]
    fn peer_order_is_class_then_name() {
        let network = network(indoc! {r#"
            [[nodes]]
            name = "n"
            wireguard_ip = "10.0.0.1/24"

            [[nodes]]
            name = "a"
            wireguard_ip = "10.0.0.2/24"

            [[nodes]]
            name = "m"
            wireguard_ip = "10.0.0.3/24"

            [[nodes]]
            name = "z"
            wireguard_ip = "10.0.0.4/24"
        "#});

        let mut bridge = intent("n", "a");
        bridge.origin = IntentOrigin::GroupBridge;
        bridge.is_bridge = true;
        let mut mesh = intent("n", "z");
        mesh.origin = IntentOrigin::GroupMesh;
        let mut star = intent("n", "m");
        star.origin = IntentOrigin::GroupStar;

        let map = build_peer_map(&network, &[bridge, mesh, star]).unwrap();
        let order: Vec<&str> = map[&"n".parse().unwrap()]
            .iter()
            .map(|d| d.peer.as_str())
            .collect();
        assert_eq!(order, vec!["z", "m", "a"]);
    }
}
