//! Capability traits for pluggable cryptography
//!
//! Everything above this module programs against [`Kem`] and
//! [`SignatureScheme`]; the concrete backend (post-quantum or classical
//! fallback) is selected once at node startup.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// 256-bit shared secret produced by a KEM. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.write_str("SharedSecret(..)")
    }
}

/// Which class of primitives a provider is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    /// CRYSTALS Kyber + Dilithium
    PostQuantum,
    /// x25519 + Ed25519. NOT quantum-safe; for constrained builds only.
    ClassicalFallback,
}

/// Key encapsulation mechanism.
pub trait Kem: Send + Sync {
    /// Generate a fresh keypair, returned as `(public, secret)` bytes.
    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// Encapsulate against a public key, returning the shared secret and the
    /// ciphertext to transmit.
    fn encapsulate(&self, public_key: &[u8]) -> Result<(SharedSecret, Vec<u8>), CryptoError>;

    /// Recover the shared secret from a ciphertext.
    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret, CryptoError>;

    /// Expected ciphertext length in bytes, used for envelope framing.
    fn ciphertext_len(&self) -> usize;
}

/// Digital signature scheme.
pub trait SignatureScheme: Send + Sync {
    /// Generate a fresh keypair, returned as `(public, secret)` bytes.
    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// Deterministic keypair derivation from a 32-byte seed, where the
    /// backend supports it.
    fn keypair_from_seed(&self, seed: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    fn sign(&self, message: &[u8], signing_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify a signature. `Ok(false)` means a well-formed but wrong
    /// signature; `Err` means the inputs were malformed.
    fn verify(&self, message: &[u8], signature: &[u8], verify_key: &[u8]) -> Result<bool, CryptoError>;
}
