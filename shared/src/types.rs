use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::str::FromStr;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Host;

use crate::address;

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Name of a node (or group) in the overlay. Also used as the stem of the
/// generated `.conf` file, hence the restricted character set.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeName(String);

impl NodeName {
    pub fn is_valid(name: &str) -> bool {
        NAME_REGEX.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeName {
    type Err = &'static str;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("names may only contain letters, digits, '_' and '-'")
        }
    }
}

impl Deref for NodeName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for NodeName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An external endpoint: IP or domain name host, plus a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self {
                host: Host::Ipv4(*v4.ip()),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self {
                host: Host::Ipv6(*v6.ip()),
                port: v6.port(),
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplitn(2, ':').collect::<Vec<&str>>().as_slice() {
            [port, host] => {
                if host.is_empty() {
                    return Err("endpoint host must not be empty");
                }
                let port: u16 = port.parse().map_err(|_| "couldn't parse port")?;
                if port == 0 {
                    return Err("port must be in 1..65535");
                }
                let host = Host::parse(host).map_err(|_| "couldn't parse host")?;
                Ok(Endpoint { host, port })
            },
            _ => Err("expected 'host:port'"),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            host => write!(f, "{host}:{}", self.port),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a directional intent names the endpoint it dials.
///
/// `Literal` is used verbatim; `Named` is looked up on the *target* node.
/// An absent reference (modelled as `Option<EndpointRef>::None`) falls back
/// to the target's first endpoint, or a passive entry when it has none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointRef {
    Literal(Endpoint),
    Named(String),
}

impl FromStr for EndpointRef {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(endpoint) = s.parse::<Endpoint>() {
            return Ok(Self::Literal(endpoint));
        }
        if NodeName::is_valid(s) {
            return Ok(Self::Named(s.to_string()));
        }
        Err("expected 'host:port' or an endpoint name")
    }
}

impl Display for EndpointRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(endpoint) => endpoint.fmt(f),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Relay,
    Server,
}

/// One identity in the overlay, frozen after document validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: NodeName,
    pub role: Role,
    pub wireguard_ip: IpNet,
    pub listen_port: Option<u16>,
    /// Endpoint name to address. Unnamed document entries were assigned
    /// synthetic `e0, e1, …` names during parsing.
    pub endpoints: BTreeMap<String, Endpoint>,
    pub dns: Option<String>,
    pub mtu: Option<u32>,
    pub post_up: Vec<String>,
    pub post_down: Vec<String>,
    pub enable_ip_forward: Option<bool>,
}

impl Node {
    /// The /32 (or /128) route to this node's overlay address.
    pub fn host_route(&self) -> IpNet {
        address::host_route(self.wireguard_ip.addr())
    }

    pub fn overlay_addr(&self) -> IpAddr {
        self.wireguard_ip.addr()
    }

    /// The endpoint dialed when an intent names none: lexicographically
    /// first, which keeps the choice stable across runs.
    pub fn default_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.values().next()
    }

    /// Whether emission should enable IP forwarding for this node.
    pub fn forwards(&self) -> bool {
        self.enable_ip_forward.unwrap_or(self.role == Role::Relay)
    }
}

/// Provenance of a peer intent, kept through the pipeline and emitted as a
/// comment so a generated block can be traced back to the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentOrigin {
    ExplicitTopology,
    GroupMesh,
    GroupStar,
    GroupChain,
    GroupSingle,
    GroupOutbound,
    GroupBidirectional,
    GroupGateway,
    GroupSelective,
    GroupFullmesh,
    GroupBridge,
}

impl IntentOrigin {
    /// Peer blocks are ordered by class: intra-group first, then hub-like
    /// links, then everything inter-group or explicit, bridges last.
    pub fn sort_class(self) -> u8 {
        match self {
            Self::GroupMesh | Self::GroupChain => 0,
            Self::GroupStar | Self::GroupGateway => 1,
            Self::GroupBridge => 3,
            _ => 2,
        }
    }
}

impl Display for IntentOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ExplicitTopology => "explicit-topology",
            Self::GroupMesh => "group-mesh",
            Self::GroupStar => "group-star",
            Self::GroupChain => "group-chain",
            Self::GroupSingle => "group-single",
            Self::GroupOutbound => "group-outbound",
            Self::GroupBidirectional => "group-bidirectional",
            Self::GroupGateway => "group-gateway",
            Self::GroupSelective => "group-selective",
            Self::GroupFullmesh => "group-fullmesh",
            Self::GroupBridge => "group-bridge",
        };
        f.write_str(s)
    }
}

/// One element of an allowed-ips list before resolution: either a concrete
/// CIDR or a symbolic reference into the group model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteToken {
    Cidr(IpNet),
    Symbolic { scope: String, attr: String },
}

impl FromStr for RouteToken {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(Self::Cidr(net));
        }
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Self::Cidr(address::host_route(addr)));
        }
        if let Some((scope, attr)) = s.rsplit_once('.') {
            if NodeName::is_valid(scope) && NodeName::is_valid(attr) {
                return Ok(Self::Symbolic {
                    scope: scope.to_string(),
                    attr: attr.to_string(),
                });
            }
        }
        Err("expected a CIDR, an address, or '<name>.<attr>'")
    }
}

impl Display for RouteToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr(net) => net.fmt(f),
            Self::Symbolic { scope, attr } => write!(f, "{scope}.{attr}"),
        }
    }
}

impl Serialize for RouteToken {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A single directional edge: "from should have a peer entry for to".
///
/// Reverse entries are never implied; see the peer-map builder for the one
/// passive-entry exception.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIntent {
    pub from: NodeName,
    pub to: NodeName,
    pub endpoint: Option<EndpointRef>,
    pub allowed_ips: Vec<RouteToken>,
    pub persistent_keepalive: Option<u16>,
    pub origin: IntentOrigin,
    pub is_bridge: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupTopology {
    Mesh,
    Star,
    Chain,
    Single,
}

impl Display for GroupTopology {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mesh => "mesh",
            Self::Star => "star",
            Self::Chain => "chain",
            Self::Single => "single",
        };
        f.write_str(s)
    }
}

impl FromStr for GroupTopology {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mesh" => Ok(Self::Mesh),
            "star" => Ok(Self::Star),
            "chain" => Ok(Self::Chain),
            "single" => Ok(Self::Single),
            _ => Err("topology must be one of mesh, star, chain, single"),
        }
    }
}

/// A named set of nodes with an internal topology. Member order is the
/// document order, which matters for chains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub members: Vec<NodeName>,
    pub topology: GroupTopology,
    pub mesh_endpoint: Option<String>,
    pub hub: Option<NodeName>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    OutboundOnly,
    Bidirectional,
    Gateway,
    Selective,
    FullMesh,
    Bridge,
}

impl FromStr for ConnectionType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound_only" => Ok(Self::OutboundOnly),
            "bidirectional" => Ok(Self::Bidirectional),
            "gateway" => Ok(Self::Gateway),
            "selective" => Ok(Self::Selective),
            "full_mesh" => Ok(Self::FullMesh),
            "bridge" => Ok(Self::Bridge),
            _ => Err(
                "type must be one of outbound_only, bidirectional, gateway, selective, \
                 full_mesh, bridge",
            ),
        }
    }
}

/// A relation between two sides, each a group name or a node name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub name: String,
    pub from: String,
    pub to: String,
    pub kind: ConnectionType,
    /// Endpoint name resolved on whichever node an edge dials.
    pub endpoint: Option<String>,
    /// Bridge only: direction key (`<a>_to_<b>`) to endpoint reference.
    pub endpoint_mapping: BTreeMap<String, EndpointRef>,
    /// Selective only: participating members.
    pub nodes: Vec<NodeName>,
    pub from_gw: Option<NodeName>,
    pub to_gw: Option<NodeName>,
    /// Routes attached to every edge this connection generates.
    pub allowed_ips: Vec<RouteToken>,
    /// Routes attached to edges originating at the named side (a side
    /// name, a member name, or a group whose members originate edges).
    pub side_allowed_ips: BTreeMap<String, Vec<RouteToken>>,
    pub persistent_keepalive: Option<u16>,
}

/// Free-standing `<name>_allowed_ips` entry: routes merged into every peer
/// entry that targets `subject` (or a member of group `subject`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingRule {
    pub subject: String,
    pub routes: Vec<RouteToken>,
}

/// Everything the engine consumes besides the node/group table: explicit
/// intents from a `peers` list, connections from a group document, and
/// document-level routing rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopologyInput {
    pub intents: Vec<PeerIntent>,
    pub connections: Vec<Connection>,
    pub rules: Vec<RoutingRule>,
}
