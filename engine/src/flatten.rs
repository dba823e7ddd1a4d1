//! Re-serialization of a resolved peer map as an equivalent
//! traditional-form document.
//!
//! The output is fully concrete: symbolic tokens and routing rules have
//! already been folded into each entry, and endpoints are literal. Feeding
//! the result back through the pipeline reproduces the same resolved map,
//! which is also what the round-trip tests lean on.

use wgtopo_shared::document::{DocEndpoints, DocNode, DocPeer, Document, NodesSection};
use wgtopo_shared::{Network, Node, PERSISTENT_KEEPALIVE_INTERVAL_SECS};

use crate::routes::ResolvedMap;

pub fn to_document(network: &Network, resolved: &ResolvedMap) -> Document {
    let nodes: Vec<DocNode> = network.nodes().map(doc_node).collect();

    let mut peers = Vec::new();
    for (from, entries) in resolved {
        for entry in entries.iter().filter(|e| !e.synthesized) {
            // The bridge flag doesn't survive flattening, so its keepalive
            // default is materialized here.
            let persistent_keepalive = if entry.is_bridge {
                entry
                    .persistent_keepalive
                    .or(Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS))
            } else {
                entry.persistent_keepalive
            };
            peers.push(DocPeer {
                from: from.to_string(),
                to: entry.peer.to_string(),
                endpoint: entry.endpoint.as_ref().map(|e| e.to_string()),
                allowed_ips: entry.allowed_ips.iter().map(|n| n.to_string()).collect(),
                persistent_keepalive,
            });
        }
    }

    Document {
        nodes: NodesSection::Flat(nodes),
        peers,
        groups: Vec::new(),
        routing: Default::default(),
    }
}

fn doc_node(node: &Node) -> DocNode {
    let endpoints = if node.endpoints.is_empty() {
        None
    } else {
        Some(DocEndpoints::Named(
            node.endpoints
                .iter()
                .map(|(name, endpoint)| (name.clone(), endpoint.to_string()))
                .collect(),
        ))
    };
    DocNode {
        name: node.name.to_string(),
        role: Some(node.role),
        wireguard_ip: node.wireguard_ip.to_string(),
        listen_port: node.listen_port,
        endpoint: None,
        endpoints,
        dns: node.dns.clone(),
        mtu: node.mtu,
        post_up: node.post_up.clone(),
        post_down: node.post_down.clone(),
        enable_ip_forward: node.enable_ip_forward,
    }
}
