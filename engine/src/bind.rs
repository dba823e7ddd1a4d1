//! The only impure step: fetching key material from the key store.
//!
//! Everything before and after this pass is a pure function of the input
//! document; key creation on disk is the pipeline's single side effect.

use std::collections::BTreeMap;

use wgtopo_keystore::{Key, KeyPair, KeyProvider, StoreError};
use wgtopo_shared::{Error, Network, NodeName};

use crate::routes::ResolvedMap;

#[derive(Debug)]
pub struct KeyMaterial {
    keypairs: BTreeMap<NodeName, KeyPair>,
    psks: BTreeMap<(NodeName, NodeName), Key>,
}

impl KeyMaterial {
    pub fn keypair(&self, node: &NodeName) -> Option<&KeyPair> {
        self.keypairs.get(node)
    }

    pub fn psk(&self, a: &NodeName, b: &NodeName) -> Option<&Key> {
        self.psks.get(&sorted_pair(a, b))
    }
}

fn sorted_pair(a: &NodeName, b: &NodeName) -> (NodeName, NodeName) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn store_error(e: StoreError) -> Error {
    Error::KeyStore {
        reason: e.to_string(),
    }
}

/// Walks nodes alphabetically so key creation order (and therefore the
/// store file) is reproducible, then requests one PSK per unordered pair
/// that appears in any peer list.
pub fn bind(
    network: &Network,
    resolved: &ResolvedMap,
    store: &mut dyn KeyProvider,
) -> Result<KeyMaterial, Error> {
    let mut keypairs = BTreeMap::new();
    for node in network.nodes() {
        let pair = store.get_or_create(&node.name).map_err(store_error)?;
        keypairs.insert(node.name.clone(), pair);
    }

    let mut psks: BTreeMap<(NodeName, NodeName), Key> = BTreeMap::new();
    for (node, peers) in resolved {
        for peer in peers {
            let pair = sorted_pair(node, &peer.peer);
            if !psks.contains_key(&pair) {
                let psk = store
                    .get_or_create_psk(&pair.0, &pair.1)
                    .map_err(store_error)?;
                psks.insert(pair, psk);
            }
        }
    }

    Ok(KeyMaterial { keypairs, psks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_map::build_peer_map;
    use crate::routes::resolve;
    use indoc::indoc;
    use wgtopo_keystore::MemoryKeyStore;
    use wgtopo_shared::{Document, IntentOrigin, PeerIntent};

    fn fixture() -> (Network, ResolvedMap) {
        let (network, _) = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "a"
            wireguard_ip = "10.0.0.1/24"

            [[nodes]]
            name = "b"
            wireguard_ip = "10.0.0.2/24"
        "#})
        .unwrap()
        .into_model()
        .unwrap();
        let intents = vec![PeerIntent {
            from: "a".parse().unwrap(),
            to: "b".parse().unwrap(),
            endpoint: None,
            allowed_ips: vec![],
            persistent_keepalive: None,
            origin: IntentOrigin::ExplicitTopology,
            is_bridge: false,
        }];
        let map = build_peer_map(&network, &intents).unwrap();
        let (resolved, _) = resolve(&network, &map, &[]).unwrap();
        (network, resolved)
    }

    #[test]
    fn psk_is_shared_between_directions() {
        let (network, resolved) = fixture();
        let mut store = MemoryKeyStore::new();
        let material = bind(&network, &resolved, &mut store).unwrap();

        let a = "a".parse().unwrap();
        let b = "b".parse().unwrap();
        assert_eq!(material.psk(&a, &b), material.psk(&b, &a));
        assert!(material.psk(&a, &b).is_some());
    }

    #[test]
    fn binding_twice_reuses_material() {
        let (network, resolved) = fixture();
        let mut store = MemoryKeyStore::new();
        let first = bind(&network, &resolved, &mut store).unwrap();
        let second = bind(&network, &resolved, &mut store).unwrap();

        let a = "a".parse().unwrap();
        assert_eq!(first.keypair(&a), second.keypair(&a));
    }
}
