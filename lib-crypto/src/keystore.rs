//! Node key management
//!
//! Holds the node's signing and KEM keypairs and rotates them on the
//! configured interval. Rotation bumps an epoch counter so peers can tell
//! a republished key from a replayed one.

use std::time::{SystemTime, UNIX_EPOCH};

use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::provider::CryptoProvider;

/// One generation of node key material.
pub struct NodeKeypair {
    pub sign_public: Vec<u8>,
    sign_secret: Zeroizing<Vec<u8>>,
    pub kem_public: Vec<u8>,
    kem_secret: Zeroizing<Vec<u8>>,
    pub epoch: u64,
    pub created_at_ms: u64,
}

impl NodeKeypair {
    pub fn sign_secret(&self) -> &[u8] {
        &self.sign_secret
    }

    pub fn kem_secret(&self) -> &[u8] {
        &self.kem_secret
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("epoch", &self.epoch)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// Keystore owning the current [`NodeKeypair`].
pub struct Keystore {
    current: NodeKeypair,
    rotation_interval_ms: u64,
}

impl Keystore {
    pub fn generate(provider: &CryptoProvider, rotation_interval_ms: u64) -> Result<Self, CryptoError> {
        Ok(Self {
            current: Self::fresh_keypair(provider, 0)?,
            rotation_interval_ms,
        })
    }

    pub fn current(&self) -> &NodeKeypair {
        &self.current
    }

    /// Whether the current keypair has outlived the rotation interval.
    pub fn rotation_due(&self, now_ms: u64) -> bool {
        self.rotation_interval_ms > 0
            && now_ms.saturating_sub(self.current.created_at_ms) >= self.rotation_interval_ms
    }

    /// Replace the current keypair, bumping the epoch. Old secrets are
    /// zeroized when the previous keypair drops.
    pub fn rotate(&mut self, provider: &CryptoProvider) -> Result<u64, CryptoError> {
        let next_epoch = self.current.epoch + 1;
        self.current = Self::fresh_keypair(provider, next_epoch)?;
        Ok(next_epoch)
    }

    fn fresh_keypair(provider: &CryptoProvider, epoch: u64) -> Result<NodeKeypair, CryptoError> {
        let (sign_public, sign_secret) = provider.signature().generate_keypair()?;
        let (kem_public, kem_secret) = provider.kem().generate_keypair()?;
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Ok(NodeKeypair {
            sign_public,
            sign_secret: Zeroizing::new(sign_secret),
            kem_public,
            kem_secret: Zeroizing::new(kem_secret),
            epoch,
            created_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_bumps_epoch_and_replaces_keys() -> Result<(), CryptoError> {
        let provider = CryptoProvider::classical_fallback();
        let mut keystore = Keystore::generate(&provider, 1)?;
        let old_public = keystore.current().sign_public.clone();

        let epoch = keystore.rotate(&provider)?;
        assert_eq!(epoch, 1);
        assert_ne!(keystore.current().sign_public, old_public);
        Ok(())
    }

    #[test]
    fn rotation_due_respects_interval() -> Result<(), CryptoError> {
        let provider = CryptoProvider::classical_fallback();
        let keystore = Keystore::generate(&provider, 60_000)?;
        let created = keystore.current().created_at_ms;

        assert!(!keystore.rotation_due(created + 1_000));
        assert!(keystore.rotation_due(created + 60_000));
        Ok(())
    }

    #[test]
    fn zero_interval_disables_rotation() -> Result<(), CryptoError> {
        let provider = CryptoProvider::classical_fallback();
        let keystore = Keystore::generate(&provider, 0)?;
        assert!(!keystore.rotation_due(u64::MAX));
        Ok(())
    }
}
