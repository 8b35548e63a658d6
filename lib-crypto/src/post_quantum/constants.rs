//! Parameter-set sizes and domain-separation strings

/// HKDF info string binding KEM shared secrets to this protocol version.
/// Encapsulation and decapsulation must use the same value.
pub const KEM_KDF_INFO: &[u8] = b"SYNCMESH-KEM-v1";

pub const KYBER512_CIPHERTEXT_BYTES: usize = 768;
pub const KYBER768_CIPHERTEXT_BYTES: usize = 1088;
pub const KYBER1024_CIPHERTEXT_BYTES: usize = 1568;

pub const KYBER512_PUBLIC_KEY_BYTES: usize = 800;
pub const KYBER768_PUBLIC_KEY_BYTES: usize = 1184;
pub const KYBER1024_PUBLIC_KEY_BYTES: usize = 1568;
