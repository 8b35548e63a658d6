//! Stable node identity
//!
//! A node identifier is a lowercase 64-character hex string (256 bits).
//! Anything else supplied from outside is normalized by SHA-256 so distance
//! arithmetic and map keys always operate on the same shape.

use serde::{Deserialize, Serialize};

use lib_crypto::hashing::hash_sha256_hex;
use lib_crypto::random::SecureRng;

use crate::error::CrdtError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Normalize an externally supplied identifier. Valid 64-hex passes
    /// through (lowercased); everything else is SHA-256-hashed.
    pub fn normalize(raw: &str) -> Result<Self, CrdtError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CrdtError::InvalidNode("empty identifier".into()));
        }

        let lowered = trimmed.to_ascii_lowercase();
        if lowered.len() == 64 && lowered.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(lowered))
        } else {
            Ok(Self(hash_sha256_hex(trimmed.as_bytes())))
        }
    }

    /// Fresh random identity for nodes started without a configured one.
    pub fn random() -> Self {
        let bytes: [u8; 32] = SecureRng.random_bytes();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 32 raw bytes behind the hex form.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Normalization guarantees 64 hex chars
        let decoded = hex::decode(&self.0).expect("node id is validated hex");
        out.copy_from_slice(&decoded);
        out
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_hex_passes_through_lowercased() {
        let raw = "ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789";
        let id = NodeId::normalize(raw).unwrap();
        assert_eq!(id.as_str(), raw.to_ascii_lowercase());
    }

    #[test]
    fn non_hex_is_hashed() {
        let id = NodeId::normalize("alice-laptop").unwrap();
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
        // Stable across calls
        assert_eq!(id, NodeId::normalize("alice-laptop").unwrap());
    }

    #[test]
    fn empty_identifier_is_rejected() {
        assert!(matches!(NodeId::normalize("  "), Err(CrdtError::InvalidNode(_))));
    }

    #[test]
    fn byte_roundtrip() {
        let id = NodeId::random();
        assert_eq!(hex::encode(id.to_bytes()), id.as_str());
    }
}
