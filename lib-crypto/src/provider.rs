//! Provider assembly
//!
//! A [`CryptoProvider`] bundles one KEM and one signature scheme and reports
//! which mode it runs in. The node builds exactly one provider at startup
//! and injects it everywhere a crypto capability is needed.

use crate::classical::{Ed25519Scheme, X25519Kem};
use crate::error::CryptoError;
use crate::hybrid;
use crate::post_quantum::{DilithiumLevel, DilithiumScheme, KyberKem, KyberLevel};
use crate::traits::{Kem, ProviderMode, SignatureScheme};

pub struct CryptoProvider {
    kem: Box<dyn Kem>,
    signature: Box<dyn SignatureScheme>,
    mode: ProviderMode,
}

impl CryptoProvider {
    /// Native CRYSTALS provider. Parameter sets come straight from the
    /// `crypto.kyberKeySize` / `crypto.dilithiumKeySize` configuration.
    pub fn post_quantum(kyber_key_size: u32, dilithium_key_size: u32) -> Result<Self, CryptoError> {
        let kyber = KyberLevel::from_key_size(kyber_key_size)?;
        let dilithium = DilithiumLevel::from_key_size(dilithium_key_size)?;
        Ok(Self {
            kem: Box::new(KyberKem::new(kyber)),
            signature: Box::new(DilithiumScheme::new(dilithium)),
            mode: ProviderMode::PostQuantum,
        })
    }

    /// Classical fallback provider (x25519 + Ed25519). Not quantum-safe.
    pub fn classical_fallback() -> Self {
        Self {
            kem: Box::new(X25519Kem),
            signature: Box::new(Ed25519Scheme),
            mode: ProviderMode::ClassicalFallback,
        }
    }

    pub fn mode(&self) -> ProviderMode {
        self.mode
    }

    /// Whether this provider may be advertised as production-grade.
    /// The fallback never is.
    pub fn is_production_grade(&self) -> bool {
        self.mode == ProviderMode::PostQuantum
    }

    pub fn kem(&self) -> &dyn Kem {
        self.kem.as_ref()
    }

    pub fn signature(&self) -> &dyn SignatureScheme {
        self.signature.as_ref()
    }

    /// Hybrid public-key encryption with this provider's KEM.
    pub fn encrypt(&self, plaintext: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        hybrid::hybrid_encrypt(self.kem.as_ref(), plaintext, public_key)
    }

    /// Inverse of [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, envelope: &[u8], secret_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        hybrid::hybrid_decrypt(self.kem.as_ref(), envelope, secret_key)
    }

    pub fn sign(&self, message: &[u8], signing_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.signature.sign(message, signing_key)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8], verify_key: &[u8]) -> Result<bool, CryptoError> {
        self.signature.verify(message, signature, verify_key)
    }
}

impl std::fmt::Debug for CryptoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoProvider").field("mode", &self.mode).finish()
    }
}
