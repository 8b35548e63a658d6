//! CRYSTALS post-quantum primitives
//!
//! Wrappers over the `pqcrypto` Kyber and Dilithium implementations plus the
//! [`Kem`]/[`SignatureScheme`] adapters for them.

pub mod constants;
pub mod dilithium;
pub mod kyber;

use crate::error::CryptoError;
use crate::traits::{Kem, SharedSecret, SignatureScheme};

/// Kyber parameter set, selected by `crypto.kyberKeySize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KyberLevel {
    Kyber512,
    Kyber768,
    Kyber1024,
}

impl KyberLevel {
    pub fn from_key_size(size: u32) -> Result<Self, CryptoError> {
        match size {
            512 => Ok(Self::Kyber512),
            768 => Ok(Self::Kyber768),
            1024 => Ok(Self::Kyber1024),
            other => Err(CryptoError::UnsupportedParameter(format!(
                "kyber key size {} (expected 512, 768 or 1024)",
                other
            ))),
        }
    }
}

/// Dilithium parameter set, selected by `crypto.dilithiumKeySize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DilithiumLevel {
    Dilithium2,
    Dilithium3,
    Dilithium5,
}

impl DilithiumLevel {
    pub fn from_key_size(size: u32) -> Result<Self, CryptoError> {
        match size {
            2 => Ok(Self::Dilithium2),
            3 => Ok(Self::Dilithium3),
            5 => Ok(Self::Dilithium5),
            other => Err(CryptoError::UnsupportedParameter(format!(
                "dilithium level {} (expected 2, 3 or 5)",
                other
            ))),
        }
    }
}

/// [`Kem`] adapter over the Kyber wrappers.
pub struct KyberKem {
    level: KyberLevel,
}

impl KyberKem {
    pub fn new(level: KyberLevel) -> Self {
        Self { level }
    }
}

impl Kem for KyberKem {
    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        Ok(kyber::keypair(self.level))
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(SharedSecret, Vec<u8>), CryptoError> {
        let (ciphertext, shared) = kyber::encapsulate(self.level, public_key, constants::KEM_KDF_INFO)?;
        Ok((SharedSecret(shared), ciphertext))
    }

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        let shared = kyber::decapsulate(self.level, ciphertext, secret_key, constants::KEM_KDF_INFO)?;
        Ok(SharedSecret(shared))
    }

    fn ciphertext_len(&self) -> usize {
        match self.level {
            KyberLevel::Kyber512 => constants::KYBER512_CIPHERTEXT_BYTES,
            KyberLevel::Kyber768 => constants::KYBER768_CIPHERTEXT_BYTES,
            KyberLevel::Kyber1024 => constants::KYBER1024_CIPHERTEXT_BYTES,
        }
    }
}

/// [`SignatureScheme`] adapter over the Dilithium wrappers.
pub struct DilithiumScheme {
    level: DilithiumLevel,
}

impl DilithiumScheme {
    pub fn new(level: DilithiumLevel) -> Self {
        Self { level }
    }
}

impl SignatureScheme for DilithiumScheme {
    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        Ok(dilithium::keypair(self.level))
    }

    fn keypair_from_seed(&self, _seed: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        // The pqcrypto C bindings do not expose seeded keygen
        Err(CryptoError::UnsupportedParameter(
            "deterministic keygen is not available for Dilithium".into(),
        ))
    }

    fn sign(&self, message: &[u8], signing_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        dilithium::sign(self.level, message, signing_key)
    }

    fn verify(&self, message: &[u8], signature: &[u8], verify_key: &[u8]) -> Result<bool, CryptoError> {
        dilithium::verify(self.level, message, signature, verify_key)
    }
}
