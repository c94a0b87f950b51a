//! Ed25519 signing keys for identity announcements.
//!
//! The secret half is confined to this module: `KeyPair` exposes signing and
//! the public key, and its `Debug` impl prints the public key only.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// An Ed25519 keypair used to sign identity payloads.
pub struct KeyPair {
    signing: SigningKey,
    public: [u8; 32],
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        // Use getrandom directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("system randomness unavailable");
        Self::from_seed(&seed)
    }

    /// Build a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    /// The 32-byte public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    /// Sign a message, returning the detached 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(self.signing.as_bytes()),
            public: self.public,
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret half
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature over a message.
///
/// Returns `false` for malformed public keys as well as bad signatures -
/// untrusted input must not be able to cause an error path.
pub fn verify(pubkey: &[u8; 32], message: &[u8], sig: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(sig)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate();
        let sig = key.sign(b"hello mesh");
        assert!(verify(&key.public_bytes(), b"hello mesh", &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let key = KeyPair::generate();
        let sig = key.sign(b"hello mesh");
        assert!(!verify(&key.public_bytes(), b"hello mess", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = key.sign(b"hello mesh");
        assert!(!verify(&other.public_bytes(), b"hello mesh", &sig));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = KeyPair::from_seed(&[7u8; 32]);
        let b = KeyPair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = KeyPair::from_seed(&[9u8; 32]);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains(&hex::encode(key.public_bytes())));
        assert!(!rendered.contains(&hex::encode([9u8; 32])));
    }
}
