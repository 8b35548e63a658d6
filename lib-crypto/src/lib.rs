//! Syncmesh Cryptography Foundation
//!
//! Pluggable KEM + signature providers behind the [`Kem`] and
//! [`SignatureScheme`] capability traits. The native backend wraps the
//! CRYSTALS post-quantum primitives (Kyber for key encapsulation, Dilithium
//! for signatures); the classical fallback wraps x25519 + Ed25519 and is
//! explicitly NOT quantum-safe.

pub mod classical;
pub mod error;
pub mod hashing;
pub mod hybrid;
pub mod keystore;
pub mod post_quantum;
pub mod provider;
pub mod random;
pub mod traits;

pub use error::CryptoError;
pub use hashing::{hash_blake3, hash_sha256};
pub use hybrid::{hybrid_decrypt, hybrid_encrypt};
pub use keystore::{Keystore, NodeKeypair};
pub use provider::CryptoProvider;
pub use random::{generate_nonce, SecureRng};
pub use traits::{Kem, ProviderMode, SharedSecret, SignatureScheme};
