//! Key material for generated WireGuard configurations.
//!
//! [`Key`] and [`KeyPair`] wrap raw curve25519 material; [`FileKeyStore`]
//! persists per-node keypairs and per-pair preshared keys in a single JSON
//! file guarded by a lock file, so repeated generator runs (and concurrent
//! ones) always hand out the same keys.

mod key;
mod store;

pub use key::{InvalidKey, Key, KeyPair};
pub use store::{FileKeyStore, KeyProvider, MemoryKeyStore, StoreError};
