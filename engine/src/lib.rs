//! The wgtopo engine: a deterministic pipeline from a validated topology
//! description to per-node WireGuard configuration records.
//!
//! Input document → group expansion → peer map → allowed-ips resolution →
//! key binding → emission. Everything except key binding is a pure
//! function of the input; the same document always produces byte-identical
//! records.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use wgtopo_keystore::KeyProvider;
use wgtopo_shared::{Diagnostic, Error, Network, NodeName, TopologyInput};

pub mod bind;
pub mod emit;
pub mod expand;
pub mod flatten;
pub mod peer_map;
pub mod routes;

pub use bind::KeyMaterial;
pub use emit::{ConfigRecord, InterfaceBlock, PeerBlock};
pub use peer_map::{PeerDraft, PeerMap};
pub use routes::{ResolvedMap, ResolvedPeer};

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    pub records: BTreeMap<NodeName, ConfigRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A failed build: one or more errors, never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildFailure {
    pub errors: Vec<Error>,
}

impl Display for BuildFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "build failed with {} error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {}

impl From<Vec<Error>> for BuildFailure {
    fn from(errors: Vec<Error>) -> Self {
        Self { errors }
    }
}

/// The pure part of the pipeline: everything up to (but excluding) key
/// binding. `check`-style callers stop here so validation never creates
/// key material.
pub fn plan(
    network: &Network,
    input: &TopologyInput,
) -> Result<(ResolvedMap, Vec<Diagnostic>), BuildFailure> {
    let (intents, rules) = expand::expand(network, input)?;
    let map = peer_map::build_peer_map(network, &intents)?;
    let (resolved, diagnostics) = routes::resolve(network, &map, &rules)?;
    Ok((resolved, diagnostics))
}

/// The full pipeline. Key binding is the only step with side effects, and
/// the key store's idempotence makes repeated builds converge on the same
/// output.
pub fn build(
    network: &Network,
    input: &TopologyInput,
    store: &mut dyn KeyProvider,
) -> Result<BuildOutput, BuildFailure> {
    let (resolved, diagnostics) = plan(network, input)?;
    let keys = bind::bind(network, &resolved, store).map_err(|e| BuildFailure { errors: vec![e] })?;
    let records = emit::emit(network, &resolved, &keys);
    log::info!(
        "built {} node record(s), {} diagnostic(s)",
        records.len(),
        diagnostics.len()
    );
    Ok(BuildOutput {
        records,
        diagnostics,
    })
}
