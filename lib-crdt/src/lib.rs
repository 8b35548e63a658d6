//! Syncmesh Replicated State
//!
//! The keyed key/value map every node carries, replicated as a state-based
//! CRDT: vector clocks for causality, deterministic tie-breaks for
//! concurrent writes, tombstones so deletes survive reordering, and an
//! append-only operation log for incremental sync.

pub mod clock;
pub mod error;
pub mod identity;
pub mod operation;
pub mod replica;

pub use clock::{CausalOrdering, LamportClock, VectorClock};
pub use error::CrdtError;
pub use identity::NodeId;
pub use operation::{OpKind, Operation};
pub use replica::{CrdtEntry, CrdtReplica, MergeReport, ReplicaConfig, ReplicaSnapshot, ReplicaStats};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
