//! Shared vocabulary of the wgtopo pipeline: address math, the entity
//! model, input documents, and the error taxonomy.

pub mod address;
pub mod document;
pub mod error;
pub mod network;
pub mod types;

pub use document::Document;
pub use error::{Diagnostic, Error};
pub use network::Network;
pub use types::*;

/// Default keepalive attached to bridge peers, matching what `wg-quick`
/// deployments conventionally use to keep NAT mappings alive.
pub const PERSISTENT_KEEPALIVE_INTERVAL_SECS: u16 = 25;
