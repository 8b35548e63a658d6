//! Crypto error taxonomy

use thiserror::Error;

/// Errors surfaced by KEM, signature, and hybrid-encryption operations.
///
/// Integrity-class failures (`AuthTagMismatch`, `SignatureInvalid`) are meant
/// to be dropped-and-counted by callers, never treated as fatal.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("authentication tag mismatch")]
    AuthTagMismatch,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("unsupported parameter: {0}")]
    UnsupportedParameter(String),
}
