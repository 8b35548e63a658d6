//! Hashing helpers shared across the workspace

use sha2::{Digest, Sha256};

/// SHA-256 digest.
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE3 digest, used where speed matters more than interop.
pub fn hash_blake3(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// SHA-256 digest as lowercase hex, the canonical identifier form.
pub fn hash_sha256_hex(data: &[u8]) -> String {
    hex::encode(hash_sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hash_sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn blake3_is_32_bytes_and_stable() {
        let a = hash_blake3(b"syncmesh");
        let b = hash_blake3(b"syncmesh");
        assert_eq!(a, b);
        assert_ne!(a, hash_blake3(b"syncmesh!"));
    }
}
