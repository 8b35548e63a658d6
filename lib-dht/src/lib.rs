//! Syncmesh DHT
//!
//! Kademlia-style routing over the 256-bit node identifier space: XOR
//! distance, 160 k-buckets ordered least-recently-seen first, and the
//! classic replacement rule that protects long-lived peers from churn.

pub mod bucket;
pub mod error;
pub mod routing;
pub mod types;

pub use bucket::KBucket;
pub use error::DhtError;
pub use routing::{AddOutcome, RoutingStats, RoutingTable, DEFAULT_K, STALE_THRESHOLD_MS};
pub use types::{PeerRecord, SeedNode};
