//! Input documents: the serde-facing model and its validation into the
//! frozen entity tables.
//!
//! Two equivalent shapes are accepted. The traditional form lists nodes and
//! explicit directional peers; the group form buckets nodes into named
//! groups and describes topologies, connections and routing rules. Both are
//! readable from TOML or JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address;
use crate::error::Error;
use crate::network::Network;
use crate::types::{
    Connection, ConnectionType, Endpoint, EndpointRef, Group, GroupTopology, IntentOrigin, Node,
    NodeName, PeerIntent, Role, RouteToken, RoutingRule, TopologyInput,
};

const ROUTING_KEY_SUFFIX: &str = "_allowed_ips";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub nodes: NodesSection,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<DocPeer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<DocGroupEntry>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodesSection {
    /// Traditional form: a flat list.
    Flat(Vec<DocNode>),
    /// Group form: group name to member nodes.
    Grouped(BTreeMap<String, Vec<DocNode>>),
}

impl Default for NodesSection {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocNode {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    pub wireguard_ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Shorthand for a single unnamed endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_up: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_down: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_ip_forward: Option<bool>,

    // Kept last so TOML serialization emits the sub-table after the
    // node's plain values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<DocEndpoints>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocEndpoints {
    Named(BTreeMap<String, String>),
    /// Unnamed entries get synthetic names `e0, e1, …` in list order.
    List(Vec<String>),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocPeer {
    pub from: String,
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

/// One entry of the `groups` list. Entries carrying `from`/`to` (or a
/// `type`) describe a connection between sides; the rest define a group's
/// internal topology.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocGroupEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_gw: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_gw: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,

    // The two maps sit last for the same TOML ordering reason as
    // `DocNode::endpoints`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoint_mapping: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing: BTreeMap<String, Vec<String>>,
}

impl DocGroupEntry {
    fn is_connection(&self) -> bool {
        self.kind.is_some() || (self.from.is_some() && self.to.is_some())
    }
}

impl Document {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::InvalidDocument {
            reason: e.to_string(),
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(|e| Error::InvalidDocument {
            reason: e.to_string(),
        })
    }

    /// Reads a document, picking the format from the file extension
    /// (`.json` is JSON, everything else is treated as TOML).
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::InvalidDocument {
            reason: format!("couldn't read {}: {e}", path.display()),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("document model always serializes")
    }

    /// Validates the document into the frozen entity tables plus the
    /// topology input the engine consumes. All shape problems are
    /// collected and reported together.
    pub fn into_model(self) -> Result<(Network, TopologyInput), Vec<Error>> {
        let mut errors = Vec::new();
        let mut nodes = Vec::new();
        let mut implicit_groups: Vec<(String, Vec<NodeName>)> = Vec::new();

        match self.nodes {
            NodesSection::Flat(list) => {
                for doc in list {
                    match parse_node(doc) {
                        Ok(node) => nodes.push(node),
                        Err(mut e) => errors.append(&mut e),
                    }
                }
            },
            NodesSection::Grouped(map) => {
                for (group_name, list) in map {
                    let mut members = Vec::new();
                    for doc in list {
                        match parse_node(doc) {
                            Ok(node) => {
                                members.push(node.name.clone());
                                nodes.push(node);
                            },
                            Err(mut e) => errors.append(&mut e),
                        }
                    }
                    implicit_groups.push((group_name, members));
                }
            },
        }

        let mut groups: BTreeMap<String, Group> = implicit_groups
            .into_iter()
            .map(|(name, members)| {
                // A bare bucket of nodes behaves as a mesh; a refinement in
                // the groups list below can override the topology.
                let topology = if members.len() == 1 {
                    GroupTopology::Single
                } else {
                    GroupTopology::Mesh
                };
                (
                    name.clone(),
                    Group {
                        name,
                        members,
                        topology,
                        mesh_endpoint: None,
                        hub: None,
                    },
                )
            })
            .collect();

        let mut connections = Vec::new();
        for entry in self.groups {
            if entry.is_connection() {
                match parse_connection(entry) {
                    Ok(conn) => connections.push(conn),
                    Err(mut e) => errors.append(&mut e),
                }
            } else {
                match parse_group(entry, &groups) {
                    Ok(group) => {
                        groups.insert(group.name.clone(), group);
                    },
                    Err(mut e) => errors.append(&mut e),
                }
            }
        }

        let mut rules = Vec::new();
        for (key, routes) in self.routing {
            match parse_rule(&key, &routes) {
                Ok(rule) => rules.push(rule),
                Err(mut e) => errors.append(&mut e),
            }
        }

        let mut intents = Vec::new();
        for peer in self.peers {
            match parse_peer(peer) {
                Ok(intent) => intents.push(intent),
                Err(mut e) => errors.append(&mut e),
            }
        }

        let network = match Network::new(nodes, groups.into_values().collect()) {
            Ok(network) => network,
            Err(mut e) => {
                errors.append(&mut e);
                return Err(errors);
            },
        };

        if errors.is_empty() {
            log::debug!(
                "validated document: {} node(s), {} connection(s), {} rule(s)",
                network.len(),
                connections.len(),
                rules.len()
            );
            Ok((
                network,
                TopologyInput {
                    intents,
                    connections,
                    rules,
                },
            ))
        } else {
            Err(errors)
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidDocument {
        reason: reason.into(),
    }
}

fn parse_name(raw: &str, errors: &mut Vec<Error>) -> Option<NodeName> {
    match raw.parse::<NodeName>() {
        Ok(name) => Some(name),
        Err(e) => {
            errors.push(invalid(format!("name {raw:?}: {e}")));
            None
        },
    }
}

fn parse_endpoint(raw: &str, errors: &mut Vec<Error>) -> Option<Endpoint> {
    match raw.parse::<Endpoint>() {
        Ok(endpoint) => Some(endpoint),
        Err(reason) => {
            errors.push(Error::InvalidEndpoint {
                given: raw.to_string(),
                reason: reason.to_string(),
            });
            None
        },
    }
}

fn parse_tokens(raw: &[String], errors: &mut Vec<Error>) -> Vec<RouteToken> {
    let mut tokens = Vec::new();
    for s in raw {
        match s.parse::<RouteToken>() {
            Ok(token) => tokens.push(token),
            Err(_) => errors.push(Error::InvalidAddress { given: s.clone() }),
        }
    }
    tokens
}

/// `Some(0)` means "explicitly disabled" and collapses to `None`.
fn normalize_keepalive(keepalive: Option<u16>) -> Option<u16> {
    keepalive.filter(|k| *k > 0)
}

fn parse_node(doc: DocNode) -> Result<Node, Vec<Error>> {
    let mut errors = Vec::new();

    let name = parse_name(&doc.name, &mut errors);

    let wireguard_ip = match address::parse_interface_address(&doc.wireguard_ip) {
        Ok(net) => Some(net),
        Err(e) => {
            errors.push(e);
            None
        },
    };

    let mut endpoints = BTreeMap::new();
    if doc.endpoint.is_some() && doc.endpoints.is_some() {
        errors.push(invalid(format!(
            "node {:?} sets both `endpoint` and `endpoints`",
            doc.name
        )));
    }
    if let Some(raw) = &doc.endpoint {
        if let Some(ep) = parse_endpoint(raw, &mut errors) {
            endpoints.insert("e0".to_string(), ep);
        }
    }
    match doc.endpoints {
        Some(DocEndpoints::Named(map)) => {
            for (name, raw) in map {
                if let Some(ep) = parse_endpoint(&raw, &mut errors) {
                    endpoints.insert(name, ep);
                }
            }
        },
        Some(DocEndpoints::List(list)) => {
            for (i, raw) in list.iter().enumerate() {
                if let Some(ep) = parse_endpoint(raw, &mut errors) {
                    endpoints.insert(format!("e{i}"), ep);
                }
            }
        },
        None => {},
    }

    match (name, wireguard_ip, errors.is_empty()) {
        (Some(name), Some(wireguard_ip), true) => Ok(Node {
            name,
            role: doc.role.unwrap_or_default(),
            wireguard_ip,
            listen_port: doc.listen_port,
            endpoints,
            dns: doc.dns,
            mtu: doc.mtu,
            post_up: doc.post_up,
            post_down: doc.post_down,
            enable_ip_forward: doc.enable_ip_forward,
        }),
        _ => Err(errors),
    }
}

fn parse_group(entry: DocGroupEntry, existing: &BTreeMap<String, Group>) -> Result<Group, Vec<Error>> {
    let mut errors = Vec::new();

    let name = match entry.name {
        Some(name) => name,
        None => return Err(vec![invalid("group entry without a name")]),
    };

    let mut members: Vec<NodeName> = Vec::new();
    for raw in &entry.nodes {
        if let Some(member) = parse_name(raw, &mut errors) {
            members.push(member);
        }
    }
    if members.is_empty() {
        match existing.get(&name) {
            Some(implicit) => members = implicit.members.clone(),
            None => errors.push(invalid(format!("group {name:?} has no members"))),
        }
    }

    let topology = match entry.topology.as_deref() {
        Some(raw) => match raw.parse::<GroupTopology>() {
            Ok(topology) => topology,
            Err(e) => {
                errors.push(invalid(format!("group {name:?}: {e}")));
                GroupTopology::Mesh
            },
        },
        None => GroupTopology::Mesh,
    };

    let hub = match entry.hub.as_deref() {
        Some(raw) => parse_name(raw, &mut errors),
        None => None,
    };

    if errors.is_empty() {
        Ok(Group {
            name,
            members,
            topology,
            mesh_endpoint: entry.mesh_endpoint,
            hub,
        })
    } else {
        Err(errors)
    }
}

fn parse_connection(entry: DocGroupEntry) -> Result<Connection, Vec<Error>> {
    let mut errors = Vec::new();

    let (from, to) = match (&entry.from, &entry.to) {
        (Some(from), Some(to)) => (from.clone(), to.clone()),
        _ => return Err(vec![invalid("connection entry needs both `from` and `to`")]),
    };
    let name = entry
        .name
        .clone()
        .unwrap_or_else(|| format!("{from}-{to}"));

    let kind = match entry.kind.as_deref() {
        Some(raw) => match raw.parse::<ConnectionType>() {
            Ok(kind) => kind,
            Err(e) => {
                errors.push(invalid(format!("connection {name:?}: {e}")));
                ConnectionType::Bidirectional
            },
        },
        None => ConnectionType::Bidirectional,
    };

    let mut endpoint_mapping = BTreeMap::new();
    for (direction, raw) in &entry.endpoint_mapping {
        match raw.parse::<EndpointRef>() {
            Ok(r) => {
                endpoint_mapping.insert(direction.clone(), r);
            },
            Err(reason) => errors.push(Error::InvalidEndpoint {
                given: raw.clone(),
                reason: reason.to_string(),
            }),
        }
    }

    let mut nodes = Vec::new();
    for raw in &entry.nodes {
        if let Some(node) = parse_name(raw, &mut errors) {
            nodes.push(node);
        }
    }

    let from_gw = entry
        .from_gw
        .as_deref()
        .and_then(|raw| parse_name(raw, &mut errors));
    let to_gw = entry
        .to_gw
        .as_deref()
        .and_then(|raw| parse_name(raw, &mut errors));

    let mut allowed_ips = parse_tokens(&entry.allowed_ips, &mut errors);
    let mut side_allowed_ips: BTreeMap<String, Vec<RouteToken>> = BTreeMap::new();
    for (key, raw) in &entry.routing {
        let tokens = parse_tokens(raw, &mut errors);
        if key == "allowed_ips" {
            allowed_ips.extend(tokens);
        } else if let Some(side) = key.strip_suffix(ROUTING_KEY_SUFFIX) {
            side_allowed_ips
                .entry(side.to_string())
                .or_default()
                .extend(tokens);
        } else {
            errors.push(invalid(format!(
                "connection {name:?}: routing key {key:?} is neither `allowed_ips` nor \
                 `<name>_allowed_ips`"
            )));
        }
    }

    if errors.is_empty() {
        Ok(Connection {
            name,
            from,
            to,
            kind,
            endpoint: entry.endpoint,
            endpoint_mapping,
            nodes,
            from_gw,
            to_gw,
            allowed_ips,
            side_allowed_ips,
            persistent_keepalive: normalize_keepalive(entry.persistent_keepalive),
        })
    } else {
        Err(errors)
    }
}

fn parse_rule(key: &str, routes: &[String]) -> Result<RoutingRule, Vec<Error>> {
    let mut errors = Vec::new();
    let subject = match key.strip_suffix(ROUTING_KEY_SUFFIX) {
        Some(subject) if !subject.is_empty() => subject.to_string(),
        _ => {
            return Err(vec![invalid(format!(
                "routing key {key:?} must look like `<name>_allowed_ips`"
            ))])
        },
    };
    let routes = parse_tokens(routes, &mut errors);
    if errors.is_empty() {
        Ok(RoutingRule { subject, routes })
    } else {
        Err(errors)
    }
}

fn parse_peer(doc: DocPeer) -> Result<PeerIntent, Vec<Error>> {
    let mut errors = Vec::new();

    let from = parse_name(&doc.from, &mut errors);
    let to = parse_name(&doc.to, &mut errors);

    let endpoint = match doc.endpoint.as_deref() {
        Some(raw) => match raw.parse::<EndpointRef>() {
            Ok(r) => Some(r),
            Err(reason) => {
                errors.push(Error::InvalidEndpoint {
                    given: raw.to_string(),
                    reason: reason.to_string(),
                });
                None
            },
        },
        None => None,
    };

    let allowed_ips = parse_tokens(&doc.allowed_ips, &mut errors);

    match (from, to, errors.is_empty()) {
        (Some(from), Some(to), true) => Ok(PeerIntent {
            from,
            to,
            endpoint,
            allowed_ips,
            persistent_keepalive: normalize_keepalive(doc.persistent_keepalive),
            origin: IntentOrigin::ExplicitTopology,
            is_bridge: false,
        }),
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn traditional_form_parses() {
        let doc = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "alpha"
            role = "server"
            wireguard_ip = "10.96.0.1/16"
            listen_port = 51820
            endpoint = "1.1.1.1:51820"

            [[nodes]]
            name = "beta"
            wireguard_ip = "10.96.0.2/16"

            [[peers]]
            from = "beta"
            to = "alpha"
            allowed_ips = ["10.96.0.0/16"]
            persistent_keepalive = 25
        "#})
        .unwrap();

        let (network, input) = doc.into_model().unwrap();
        assert_eq!(network.len(), 2);
        let alpha = network.node("alpha").unwrap();
        assert_eq!(alpha.role, Role::Server);
        assert_eq!(alpha.endpoints["e0"].to_string(), "1.1.1.1:51820");
        assert_eq!(input.intents.len(), 1);
        assert_eq!(input.intents[0].persistent_keepalive, Some(25));
        assert_eq!(input.intents[0].origin, IntentOrigin::ExplicitTopology);
    }

    #[test]
    fn group_form_parses() {
        let doc = Document::from_toml_str(indoc! {r#"
            [nodes]
            office = [
              { name = "a", wireguard_ip = "10.96.0.2/16", endpoint = "1.1.1.1:51820" },
              { name = "b", wireguard_ip = "10.96.0.3/16", endpoint = "1.1.1.2:51820" },
            ]
            relay = [
              { name = "r", wireguard_ip = "10.96.1.1/16", role = "relay", endpoint = "9.9.9.9:51820" },
            ]

            [[groups]]
            name = "office"
            topology = "mesh"

            [[groups]]
            from = "office"
            to = "relay"
            type = "outbound_only"

            [routing]
            r_allowed_ips = ["192.168.100.0/24"]
        "#})
        .unwrap();

        let (network, input) = doc.into_model().unwrap();
        assert_eq!(network.len(), 3);
        assert_eq!(network.group("office").unwrap().members.len(), 2);
        assert_eq!(
            network.group("relay").unwrap().topology,
            GroupTopology::Single
        );
        assert_eq!(input.connections.len(), 1);
        assert_eq!(input.connections[0].kind, ConnectionType::OutboundOnly);
        assert_eq!(input.rules.len(), 1);
        assert_eq!(input.rules[0].subject, "r");
    }

    #[test]
    fn json_form_parses() {
        let doc = Document::from_json_str(
            r#"{
                "nodes": [
                    {"name": "a", "wireguard_ip": "10.0.0.1/24"},
                    {"name": "b", "wireguard_ip": "10.0.0.2/24"}
                ],
                "peers": [{"from": "a", "to": "b"}]
            }"#,
        )
        .unwrap();
        let (network, input) = doc.into_model().unwrap();
        assert_eq!(network.len(), 2);
        assert_eq!(input.intents.len(), 1);
    }

    #[test]
    fn endpoint_list_gets_synthetic_names() {
        let doc = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "a"
            wireguard_ip = "10.0.0.1/24"
            endpoints = ["1.1.1.1:51820", "10.10.10.10:22222"]
        "#})
        .unwrap();
        let (network, _) = doc.into_model().unwrap();
        let a = network.node("a").unwrap();
        assert_eq!(a.endpoints["e0"].to_string(), "1.1.1.1:51820");
        assert_eq!(a.endpoints["e1"].to_string(), "10.10.10.10:22222");
    }

    #[test]
    fn duplicate_ip_is_fatal() {
        let doc = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "A"
            wireguard_ip = "10.96.0.2/16"

            [[nodes]]
            name = "B"
            wireguard_ip = "10.96.0.2/16"
        "#})
        .unwrap();
        let errors = doc.into_model().unwrap_err();
        assert!(matches!(&errors[0], Error::DuplicateNodeIp { names, .. }
            if names == &vec!["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn errors_accumulate() {
        let doc = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "ok name"
            wireguard_ip = "not-an-ip"
            endpoint = "1.1.1.1:0"
        "#})
        .unwrap();
        let errors = doc.into_model().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn keepalive_zero_disables() {
        let doc = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "a"
            wireguard_ip = "10.0.0.1/24"

            [[nodes]]
            name = "b"
            wireguard_ip = "10.0.0.2/24"

            [[peers]]
            from = "a"
            to = "b"
            persistent_keepalive = 0
        "#})
        .unwrap();
        let (_, input) = doc.into_model().unwrap();
        assert_eq!(input.intents[0].persistent_keepalive, None);
    }

    #[test]
    fn bad_routing_key_is_rejected() {
        let doc = Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "a"
            wireguard_ip = "10.0.0.1/24"

            [routing]
            not_a_rule = ["10.0.0.0/24"]
        "#})
        .unwrap();
        let errors = doc.into_model().unwrap_err();
        assert!(matches!(&errors[0], Error::InvalidDocument { .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Document::from_toml_str(indoc! {r#"
            [[nodes]]
            name = "a"
            wireguard_ip = "10.0.0.1/24"
            frobnicate = true
        "#})
        .is_err());
    }
}
