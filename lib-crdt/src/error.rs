//! Replica error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrdtError {
    /// An identifier normalized to the empty value.
    #[error("invalid node identifier: {0}")]
    InvalidNode(String),

    /// The operation log cannot hold even one more entry.
    #[error("operation log overflow (max {max})")]
    LogOverflow { max: usize },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
