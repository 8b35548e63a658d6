//! Classical fallback provider
//!
//! x25519 Diffie-Hellman dressed up as a KEM plus Ed25519 signatures.
//! This backend exists so the node can run where the CRYSTALS
//! implementations are unavailable. It is NOT quantum-safe and must not be
//! reported as production-grade; [`ProviderMode::ClassicalFallback`] makes
//! that visible to callers and tests.
//!
//! [`ProviderMode::ClassicalFallback`]: crate::traits::ProviderMode

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha3::Sha3_256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::traits::{Kem, SharedSecret, SignatureScheme};

const X25519_KEY_BYTES: usize = 32;
const ED25519_SIG_BYTES: usize = 64;
const FALLBACK_KDF_INFO: &[u8] = b"SYNCMESH-FALLBACK-KEM-v1";

/// x25519 ECDH-as-KEM: the "ciphertext" is an ephemeral public key.
pub struct X25519Kem;

impl X25519Kem {
    fn secret_from_bytes(bytes: &[u8]) -> Result<StaticSecret, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("x25519 secret key must be 32 bytes".into()))?;
        Ok(StaticSecret::from(arr))
    }

    fn public_from_bytes(bytes: &[u8]) -> Result<X25519Public, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("x25519 public key must be 32 bytes".into()))?;
        Ok(X25519Public::from(arr))
    }

    fn derive(raw: &[u8; 32]) -> Result<SharedSecret, CryptoError> {
        // Reject the all-zero output produced by low-order points before it
        // reaches the KDF. Constant-time compare keeps the check uniform.
        if bool::from(raw.ct_eq(&[0u8; 32])) {
            return Err(CryptoError::InvalidCiphertext("low-order x25519 point".into()));
        }
        let hk = Hkdf::<Sha3_256>::new(None, raw);
        let mut out = [0u8; 32];
        hk.expand(FALLBACK_KDF_INFO, &mut out)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(SharedSecret(out))
    }
}

impl Kem for X25519Kem {
    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Ok((public.as_bytes().to_vec(), secret.to_bytes().to_vec()))
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(SharedSecret, Vec<u8>), CryptoError> {
        let their_public = Self::public_from_bytes(public_key)?;
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ciphertext = X25519Public::from(&ephemeral).as_bytes().to_vec();
        let shared = Self::derive(ephemeral.diffie_hellman(&their_public).as_bytes())?;
        Ok((shared, ciphertext))
    }

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        let secret = Self::secret_from_bytes(secret_key)?;
        let ephemeral_public = Self::public_from_bytes(ciphertext)
            .map_err(|_| CryptoError::InvalidCiphertext("x25519 ciphertext must be 32 bytes".into()))?;
        Self::derive(secret.diffie_hellman(&ephemeral_public).as_bytes())
    }

    fn ciphertext_len(&self) -> usize {
        X25519_KEY_BYTES
    }
}

/// Ed25519 signatures with seeded deterministic keygen.
pub struct Ed25519Scheme;

impl SignatureScheme for Ed25519Scheme {
    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let signing = SigningKey::generate(&mut OsRng);
        Ok((
            signing.verifying_key().to_bytes().to_vec(),
            signing.to_bytes().to_vec(),
        ))
    }

    fn keypair_from_seed(&self, seed: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let signing = SigningKey::from_bytes(seed);
        Ok((
            signing.verifying_key().to_bytes().to_vec(),
            signing.to_bytes().to_vec(),
        ))
    }

    fn sign(&self, message: &[u8], signing_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let arr: [u8; 32] = signing_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ed25519 signing key must be 32 bytes".into()))?;
        let signing = SigningKey::from_bytes(&arr);
        Ok(signing.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8], verify_key: &[u8]) -> Result<bool, CryptoError> {
        let key_arr: [u8; 32] = verify_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ed25519 verify key must be 32 bytes".into()))?;
        let verifying = VerifyingKey::from_bytes(&key_arr)
            .map_err(|_| CryptoError::InvalidKey("not a valid ed25519 point".into()))?;
        let sig_arr: [u8; ED25519_SIG_BYTES] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidCiphertext("ed25519 signature must be 64 bytes".into()))?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
        Ok(verifying.verify(message, &sig).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_kem_roundtrip() -> Result<(), CryptoError> {
        let kem = X25519Kem;
        let (pk, sk) = kem.generate_keypair()?;
        let (secret_a, ct) = kem.encapsulate(&pk)?;
        let secret_b = kem.decapsulate(&sk, &ct)?;
        assert_eq!(secret_a.as_bytes(), secret_b.as_bytes());
        Ok(())
    }

    #[test]
    fn ed25519_sign_verify() -> Result<(), CryptoError> {
        let scheme = Ed25519Scheme;
        let (pk, sk) = scheme.generate_keypair()?;
        let sig = scheme.sign(b"hello mesh", &sk)?;
        assert!(scheme.verify(b"hello mesh", &sig, &pk)?);
        assert!(!scheme.verify(b"hello mess", &sig, &pk)?);
        Ok(())
    }

    #[test]
    fn seeded_keygen_is_deterministic() -> Result<(), CryptoError> {
        let scheme = Ed25519Scheme;
        let seed = [7u8; 32];
        let (pk_a, _) = scheme.keypair_from_seed(&seed)?;
        let (pk_b, _) = scheme.keypair_from_seed(&seed)?;
        assert_eq!(pk_a, pk_b);
        Ok(())
    }

    #[test]
    fn wrong_length_ciphertext_is_rejected() {
        let kem = X25519Kem;
        let (_, sk) = kem.generate_keypair().unwrap();
        assert!(matches!(
            kem.decapsulate(&sk, &[1u8; 16]),
            Err(CryptoError::InvalidCiphertext(_))
        ));
    }
}
