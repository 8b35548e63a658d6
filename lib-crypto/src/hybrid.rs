//! Hybrid encryption: KEM-derived key + ChaCha20-Poly1305
//!
//! Envelope layout: `kem_ciphertext || nonce(12) || aead_ciphertext`.
//! The KEM half is whatever backend the provider was built with, so the
//! same envelope code serves both the post-quantum and fallback modes.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::error::CryptoError;
use crate::random::generate_nonce;
use crate::traits::Kem;

const NONCE_BYTES: usize = 12;

/// Encrypt `plaintext` to the holder of `public_key`.
pub fn hybrid_encrypt(kem: &dyn Kem, plaintext: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (shared, kem_ct) = kem.encapsulate(public_key)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()));

    let nonce = generate_nonce();
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AuthTagMismatch)?;

    let mut envelope = Vec::with_capacity(kem_ct.len() + NONCE_BYTES + sealed.len());
    envelope.extend_from_slice(&kem_ct);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&sealed);
    Ok(envelope)
}

/// Decrypt an envelope produced by [`hybrid_encrypt`].
///
/// Fails with [`CryptoError::AuthTagMismatch`] if the AEAD tag does not
/// verify, which covers any bit of tampering past the KEM ciphertext.
pub fn hybrid_decrypt(kem: &dyn Kem, envelope: &[u8], secret_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let kem_ct_len = kem.ciphertext_len();
    if envelope.len() < kem_ct_len + NONCE_BYTES {
        return Err(CryptoError::InvalidCiphertext(format!(
            "envelope too short: {} bytes",
            envelope.len()
        )));
    }

    let (kem_ct, rest) = envelope.split_at(kem_ct_len);
    let (nonce, sealed) = rest.split_at(NONCE_BYTES);

    let shared = kem.decapsulate(secret_key, kem_ct)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AuthTagMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classical::X25519Kem;
    use crate::post_quantum::{KyberKem, KyberLevel};

    #[test]
    fn kyber_hybrid_roundtrip() -> Result<(), CryptoError> {
        let kem = KyberKem::new(KyberLevel::Kyber512);
        let (pk, sk) = kem.generate_keypair()?;

        let envelope = hybrid_encrypt(&kem, b"shared document state", &pk)?;
        let plaintext = hybrid_decrypt(&kem, &envelope, &sk)?;
        assert_eq!(plaintext, b"shared document state");
        Ok(())
    }

    #[test]
    fn fallback_hybrid_roundtrip() -> Result<(), CryptoError> {
        let kem = X25519Kem;
        let (pk, sk) = kem.generate_keypair()?;

        let envelope = hybrid_encrypt(&kem, b"fallback payload", &pk)?;
        let plaintext = hybrid_decrypt(&kem, &envelope, &sk)?;
        assert_eq!(plaintext, b"fallback payload");
        Ok(())
    }

    #[test]
    fn tampered_envelope_fails_auth() {
        let kem = KyberKem::new(KyberLevel::Kyber512);
        let (pk, sk) = kem.generate_keypair().unwrap();

        let mut envelope = hybrid_encrypt(&kem, b"payload", &pk).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;

        assert!(matches!(
            hybrid_decrypt(&kem, &envelope, &sk),
            Err(CryptoError::AuthTagMismatch)
        ));
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let kem = KyberKem::new(KyberLevel::Kyber512);
        let (_, sk) = kem.generate_keypair().unwrap();
        assert!(matches!(
            hybrid_decrypt(&kem, &[0u8; 40], &sk),
            Err(CryptoError::InvalidCiphertext(_))
        ));
    }
}
