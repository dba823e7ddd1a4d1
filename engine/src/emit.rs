//! Final assembly of per-node configuration records.

use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::Serialize;

use wgtopo_shared::{
    Endpoint, Network, Node, NodeName, PERSISTENT_KEEPALIVE_INTERVAL_SECS,
};

use crate::bind::KeyMaterial;
use crate::routes::ResolvedMap;

const FORWARD_UP_V4: &str = "sysctl -w net.ipv4.ip_forward=1";
const FORWARD_DOWN_V4: &str = "sysctl -w net.ipv4.ip_forward=0";
const FORWARD_UP_V6: &str = "sysctl -w net.ipv6.conf.all.forwarding=1";
const FORWARD_DOWN_V6: &str = "sysctl -w net.ipv6.conf.all.forwarding=0";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigRecord {
    pub interface: InterfaceBlock,
    pub peers: Vec<PeerBlock>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InterfaceBlock {
    pub name: NodeName,
    pub private_key: String,
    pub address: IpNet,
    pub listen_port: Option<u16>,
    pub dns: Option<String>,
    pub mtu: Option<u32>,
    pub post_up: Vec<String>,
    pub post_down: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeerBlock {
    pub name: NodeName,
    pub public_key: String,
    pub preshared_key: Option<String>,
    /// Absent for passive peers: no dialing, incoming handshakes only.
    pub endpoint: Option<Endpoint>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
    /// Provenance, rendered as a comment above the block.
    pub comment: String,
}

pub fn emit(
    network: &Network,
    resolved: &ResolvedMap,
    keys: &KeyMaterial,
) -> BTreeMap<NodeName, ConfigRecord> {
    let mut records = BTreeMap::new();

    for node in network.nodes() {
        let keypair = keys.keypair(&node.name).expect("all nodes were bound");
        let (post_up, post_down) = hooks(node);

        let peers = resolved
            .get(&node.name)
            .map(|peers| {
                peers
                    .iter()
                    .map(|peer| {
                        let target_keys =
                            keys.keypair(&peer.peer).expect("all nodes were bound");
                        let persistent_keepalive = if peer.is_bridge {
                            peer.persistent_keepalive
                                .or(Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS))
                        } else {
                            peer.persistent_keepalive
                        };
                        PeerBlock {
                            name: peer.peer.clone(),
                            public_key: target_keys.public.to_base64(),
                            preshared_key: keys
                                .psk(&node.name, &peer.peer)
                                .map(|k| k.to_base64()),
                            endpoint: peer.endpoint.clone(),
                            allowed_ips: peer.allowed_ips.clone(),
                            persistent_keepalive,
                            comment: format!("{}: {}", peer.origin, peer.peer),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        records.insert(
            node.name.clone(),
            ConfigRecord {
                interface: InterfaceBlock {
                    name: node.name.clone(),
                    private_key: keypair.private.to_base64(),
                    address: node.wireguard_ip,
                    listen_port: node.listen_port,
                    dns: node.dns.clone(),
                    mtu: node.mtu,
                    post_up,
                    post_down,
                },
                peers,
            },
        );
    }

    records
}

/// Document hooks are passed through untouched; forwarding nodes without
/// their own hooks get the sysctl pair for their address family.
fn hooks(node: &Node) -> (Vec<String>, Vec<String>) {
    if !node.post_up.is_empty() || !node.post_down.is_empty() {
        return (node.post_up.clone(), node.post_down.clone());
    }
    if node.forwards() {
        let (up, down) = match node.wireguard_ip {
            IpNet::V4(_) => (FORWARD_UP_V4, FORWARD_DOWN_V4),
            IpNet::V6(_) => (FORWARD_UP_V6, FORWARD_DOWN_V6),
        };
        return (vec![up.to_string()], vec![down.to_string()]);
    }
    (Vec::new(), Vec::new())
}
