use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};

/// Error returned when key text is not 32 bytes of valid base64.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct InvalidKey;

impl std::error::Error for InvalidKey {}

impl fmt::Display for InvalidKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid key format")
    }
}

/// A WireGuard key: 32 raw bytes.
///
/// Private, public and preshared keys all share this representation;
/// which one a `Key` is depends on where it came from. Callers are
/// responsible for not mixing them up.
#[derive(PartialEq, Eq, Clone, Hash)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// Generates a new private key, clamped per curve25519 rules.
    #[must_use]
    pub fn generate_private() -> Self {
        use rand_core::{OsRng, RngCore};

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Generates a new preshared key. No clamping; any 32 bytes are valid.
    #[must_use]
    pub fn generate_preshared() -> Self {
        use rand_core::{OsRng, RngCore};

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derives the public key for this private key.
    #[must_use]
    pub fn get_public(&self) -> Self {
        let secret = StaticSecret::from(self.0);
        let public = PublicKey::from(&secret);

        Self(public.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The standard base64 form used by `wg` and `wg-quick`.
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    pub fn from_base64(key: &str) -> Result<Self, InvalidKey> {
        let decoded = base64::decode(key).map_err(|_| InvalidKey)?;
        if decoded.len() != 32 {
            return Err(InvalidKey);
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Short hex prefix for log lines; never enough to reconstruct the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({}…)", self.fingerprint())
    }
}

/// A private key together with its derived public key.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KeyPair {
    pub private: Key,
    pub public: Key,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(Key::generate_private())
    }

    pub fn from_private(key: Key) -> Self {
        let public = key.get_public();
        KeyPair {
            private: key,
            public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_derivation_matches_wg() {
        let private = Key::from_base64("SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=").unwrap();
        let public = private.get_public();

        assert_eq!(
            public.to_base64(),
            "DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8="
        );
    }

    #[test]
    fn base64_round_trip() {
        let key = Key::generate_preshared();
        assert_eq!(key, Key::from_base64(&key.to_base64()).unwrap());
    }

    #[test]
    fn rejects_wrong_length_and_garbage() {
        assert_eq!(Key::from_base64("dG9vIHNob3J0"), Err(InvalidKey));
        assert_eq!(Key::from_base64("not base64 at all!"), Err(InvalidKey));
    }

    #[test]
    fn generated_keys_are_nonzero_and_distinct() {
        let first = Key::generate_private();
        assert_ne!(first.as_bytes(), &[0u8; 32]);
        for _ in 0..1000 {
            assert_ne!(first, Key::generate_private());
        }
    }

    #[test]
    fn keypair_public_differs_from_private() {
        let pair = KeyPair::generate();
        assert_ne!(pair.private, pair.public);
    }
}
