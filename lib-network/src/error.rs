//! Network error taxonomy

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    /// Peer cap reached; the connection attempt was refused.
    #[error("peer limit reached ({0} peers)")]
    PeerLimit(usize),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("crypto failure: {0}")]
    Crypto(#[from] lib_crypto::CryptoError),

    #[error("node is shutting down")]
    ShuttingDown,
}
