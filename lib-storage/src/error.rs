//! Storage error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("local storage full: {used} of {max} bytes in use")]
    StorageFull { used: u64, max: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
