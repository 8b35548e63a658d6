//! Secure random source

use rand::rngs::OsRng;
use rand::RngCore;

/// Thin wrapper over the OS CSPRNG so callers take an injected source
/// instead of reaching for a global.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureRng;

impl SecureRng {
    pub fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    pub fn random_bytes<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        OsRng.fill_bytes(&mut out);
        out
    }
}

/// Fresh 96-bit nonce for ChaCha20-Poly1305.
pub fn generate_nonce() -> [u8; 12] {
    SecureRng.random_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_not_repeated() {
        // Statistically impossible to collide in two draws
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
