//! CRYSTALS-Dilithium wrapper functions

use pqcrypto_dilithium::{dilithium2, dilithium3, dilithium5};
use pqcrypto_traits::sign::{PublicKey as SignPublicKey, SecretKey as SignSecretKey, SignedMessage};

use crate::error::CryptoError;
use crate::post_quantum::DilithiumLevel;

/// Generate a keypair for the given parameter set, as `(public, secret)`.
pub fn keypair(level: DilithiumLevel) -> (Vec<u8>, Vec<u8>) {
    match level {
        DilithiumLevel::Dilithium2 => {
            let (pk, sk) = dilithium2::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        DilithiumLevel::Dilithium3 => {
            let (pk, sk) = dilithium3::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        DilithiumLevel::Dilithium5 => {
            let (pk, sk) = dilithium5::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
    }
}

/// Sign a message. The returned bytes are the signed-message form, which
/// embeds the message and is opened during verification.
pub fn sign(level: DilithiumLevel, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match level {
        DilithiumLevel::Dilithium2 => {
            let sk = dilithium2::SecretKey::from_bytes(secret_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Dilithium2 secret key".into()))?;
            Ok(dilithium2::sign(message, &sk).as_bytes().to_vec())
        }
        DilithiumLevel::Dilithium3 => {
            let sk = dilithium3::SecretKey::from_bytes(secret_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Dilithium3 secret key".into()))?;
            Ok(dilithium3::sign(message, &sk).as_bytes().to_vec())
        }
        DilithiumLevel::Dilithium5 => {
            let sk = dilithium5::SecretKey::from_bytes(secret_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Dilithium5 secret key".into()))?;
            Ok(dilithium5::sign(message, &sk).as_bytes().to_vec())
        }
    }
}

/// Verify a signed message against the expected message bytes.
pub fn verify(level: DilithiumLevel, message: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
    match level {
        DilithiumLevel::Dilithium2 => {
            let pk = dilithium2::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Dilithium2 public key".into()))?;
            let sig = dilithium2::SignedMessage::from_bytes(signature)
                .map_err(|_| CryptoError::InvalidCiphertext("malformed Dilithium2 signature".into()))?;
            Ok(matches!(dilithium2::open(&sig, &pk), Ok(opened) if opened == message))
        }
        DilithiumLevel::Dilithium3 => {
            let pk = dilithium3::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Dilithium3 public key".into()))?;
            let sig = dilithium3::SignedMessage::from_bytes(signature)
                .map_err(|_| CryptoError::InvalidCiphertext("malformed Dilithium3 signature".into()))?;
            Ok(matches!(dilithium3::open(&sig, &pk), Ok(opened) if opened == message))
        }
        DilithiumLevel::Dilithium5 => {
            let pk = dilithium5::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::InvalidKey("malformed Dilithium5 public key".into()))?;
            let sig = dilithium5::SignedMessage::from_bytes(signature)
                .map_err(|_| CryptoError::InvalidCiphertext("malformed Dilithium5 signature".into()))?;
            Ok(matches!(dilithium5::open(&sig, &pk), Ok(opened) if opened == message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dilithium2_sign_verify() -> Result<(), CryptoError> {
        let (pk, sk) = keypair(DilithiumLevel::Dilithium2);
        let sig = sign(DilithiumLevel::Dilithium2, b"replicated operation", &sk)?;
        assert!(verify(DilithiumLevel::Dilithium2, b"replicated operation", &sig, &pk)?);
        assert!(!verify(DilithiumLevel::Dilithium2, b"tampered operation", &sig, &pk)?);
        Ok(())
    }
}
