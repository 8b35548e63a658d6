//! CRYSTALS-Kyber wrapper functions
//!
//! Raw byte-slice wrappers over the three Kyber parameter sets. Shared
//! secrets are passed through HKDF-SHA3 before use so the symmetric layer
//! never sees raw KEM output.

use hkdf::Hkdf;
use pqcrypto_kyber::{kyber1024, kyber512, kyber768};
use pqcrypto_traits::kem::{Ciphertext, PublicKey as KemPublicKey, SecretKey as KemSecretKey, SharedSecret};
use sha3::Sha3_256;

use crate::error::CryptoError;
use crate::post_quantum::KyberLevel;

/// Generate a keypair for the given parameter set, as `(public, secret)`.
pub fn keypair(level: KyberLevel) -> (Vec<u8>, Vec<u8>) {
    match level {
        KyberLevel::Kyber512 => {
            let (pk, sk) = kyber512::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        KyberLevel::Kyber768 => {
            let (pk, sk) = kyber768::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        KyberLevel::Kyber1024 => {
            let (pk, sk) = kyber1024::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
    }
}

/// Encapsulate a shared secret, returning `(ciphertext, derived_secret)`.
///
/// `kdf_info` must match the value used on the decapsulating side.
pub fn encapsulate(level: KyberLevel, public_key: &[u8], kdf_info: &[u8]) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let (raw_secret, ciphertext) = match level {
        KyberLevel::Kyber512 => {
            let pk = kyber512::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Kyber512 public key".into()))?;
            let (ss, ct) = kyber512::encapsulate(&pk);
            (ss.as_bytes().to_vec(), ct.as_bytes().to_vec())
        }
        KyberLevel::Kyber768 => {
            let pk = kyber768::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Kyber768 public key".into()))?;
            let (ss, ct) = kyber768::encapsulate(&pk);
            (ss.as_bytes().to_vec(), ct.as_bytes().to_vec())
        }
        KyberLevel::Kyber1024 => {
            let pk = kyber1024::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Kyber1024 public key".into()))?;
            let (ss, ct) = kyber1024::encapsulate(&pk);
            (ss.as_bytes().to_vec(), ct.as_bytes().to_vec())
        }
    };

    Ok((ciphertext, derive_secret(&raw_secret, kdf_info)?))
}

/// Decapsulate a ciphertext back into the derived shared secret.
pub fn decapsulate(level: KyberLevel, ciphertext: &[u8], secret_key: &[u8], kdf_info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let raw_secret = match level {
        KyberLevel::Kyber512 => {
            let sk = kyber512::SecretKey::from_bytes(secret_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Kyber512 secret key".into()))?;
            let ct = kyber512::Ciphertext::from_bytes(ciphertext)
                .map_err(|_| CryptoError::InvalidCiphertext("malformed Kyber512 ciphertext".into()))?;
            kyber512::decapsulate(&ct, &sk).as_bytes().to_vec()
        }
        KyberLevel::Kyber768 => {
            let sk = kyber768::SecretKey::from_bytes(secret_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Kyber768 secret key".into()))?;
            let ct = kyber768::Ciphertext::from_bytes(ciphertext)
                .map_err(|_| CryptoError::InvalidCiphertext("malformed Kyber768 ciphertext".into()))?;
            kyber768::decapsulate(&ct, &sk).as_bytes().to_vec()
        }
        KyberLevel::Kyber1024 => {
            let sk = kyber1024::SecretKey::from_bytes(secret_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Kyber1024 secret key".into()))?;
            let ct = kyber1024::Ciphertext::from_bytes(ciphertext)
                .map_err(|_| CryptoError::InvalidCiphertext("malformed Kyber1024 ciphertext".into()))?;
            kyber1024::decapsulate(&ct, &sk).as_bytes().to_vec()
        }
    };

    derive_secret(&raw_secret, kdf_info)
}

fn derive_secret(raw: &[u8], kdf_info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha3_256>::new(None, raw);
    let mut out = [0u8; 32];
    hk.expand(kdf_info, &mut out)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post_quantum::constants::KEM_KDF_INFO;

    #[test]
    fn kyber512_roundtrip() -> Result<(), CryptoError> {
        let (pk, sk) = keypair(KyberLevel::Kyber512);
        let (ct, secret_a) = encapsulate(KyberLevel::Kyber512, &pk, KEM_KDF_INFO)?;
        let secret_b = decapsulate(KyberLevel::Kyber512, &ct, &sk, KEM_KDF_INFO)?;
        assert_eq!(secret_a, secret_b);
        Ok(())
    }

    #[test]
    fn different_kdf_info_yields_different_secret() -> Result<(), CryptoError> {
        let (pk, sk) = keypair(KyberLevel::Kyber512);
        let (ct, secret_a) = encapsulate(KyberLevel::Kyber512, &pk, b"info-a")?;
        let secret_b = decapsulate(KyberLevel::Kyber512, &ct, &sk, b"info-b")?;
        assert_ne!(secret_a, secret_b);
        Ok(())
    }

    #[test]
    fn malformed_public_key_is_rejected() {
        let err = encapsulate(KyberLevel::Kyber512, &[0u8; 7], KEM_KDF_INFO);
        assert!(matches!(err, Err(CryptoError::InvalidKey(_))));
    }
}
