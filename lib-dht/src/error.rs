//! DHT error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("invalid node identifier: {0}")]
    InvalidNode(String),

    #[error("peer not found: {0}")]
    NotFound(String),
}
