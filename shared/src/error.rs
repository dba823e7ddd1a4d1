use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Everything that can go wrong between reading a document and emitting
/// per-node records. Errors are plain values; the pipeline collects them
/// into a report instead of bailing on the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("{context} references unknown node or group {name:?}")]
    UnknownReference { name: String, context: String },

    #[error("group {group:?}: {reason}")]
    TopologyArity { group: String, reason: String },

    #[error("node {node:?} has no endpoint named {endpoint:?} (wanted by {wanted_by:?})")]
    EndpointNotFound {
        node: String,
        endpoint: String,
        wanted_by: String,
    },

    #[error("bad route token {token:?}: {reason}")]
    BadRouteToken { token: String, reason: String },

    #[error(
        "allowed-ips overlap on node {node:?}: peer {peer_a:?} carries {cidr_a} which collides \
         with {cidr_b} on peer {peer_b:?}"
    )]
    AllowedIpsOverlap {
        node: String,
        peer_a: String,
        peer_b: String,
        cidr_a: IpNet,
        cidr_b: IpNet,
    },

    #[error("bridge {connection:?} has no endpoint mapping for direction {direction:?}")]
    BridgeMappingMissing {
        connection: String,
        direction: String,
    },

    #[error("node {node:?} lists itself as a peer")]
    SelfPeer { node: String },

    #[error("duplicate node name {name:?}")]
    DuplicateNodeName { name: String },

    #[error("nodes {names:?} share the overlay address {ip}")]
    DuplicateNodeIp { names: Vec<String>, ip: IpAddr },

    #[error("invalid address {given:?}")]
    InvalidAddress { given: String },

    #[error("invalid endpoint {given:?}: {reason}")]
    InvalidEndpoint { given: String, reason: String },

    #[error("key store failure: {reason}")]
    KeyStore { reason: String },
}

/// Non-fatal findings reported alongside a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A default route sharing one peer's allowed-ips with narrower routes.
    DefaultRouteMixed { node: String, peer: String },

    /// A route broader than /16; worth a second look in an overlay.
    BroadRoute { node: String, peer: String, cidr: IpNet },

    /// A gateway or bridge entry that resolved to nothing beyond the
    /// target's own host route, which usually means a routing rule was
    /// forgotten.
    BareRelayRoute { node: String, peer: String },

    /// Intra-group and inter-group intents merged on the same peer pair;
    /// the allowed-ips were combined, which may or may not be what the
    /// author meant.
    MixedOriginMerge { node: String, peer: String },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultRouteMixed { node, peer } => write!(
                f,
                "{node}: peer {peer} mixes a default route with other allowed-ips"
            ),
            Self::BroadRoute { node, peer, cidr } => {
                write!(f, "{node}: peer {peer} routes the very broad {cidr}")
            },
            Self::BareRelayRoute { node, peer } => write!(
                f,
                "{node}: relay-path peer {peer} only routes its own host address; missing a \
                 routing rule?"
            ),
            Self::MixedOriginMerge { node, peer } => write!(
                f,
                "{node}: peer {peer} combines intra-group and inter-group allowed-ips"
            ),
        }
    }
}
