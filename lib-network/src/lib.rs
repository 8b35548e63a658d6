//! Syncmesh Networking
//!
//! Three cooperating pieces: the peer transport (reliable stream plus
//! datagram channel per peer, heartbeats, reconnect backoff), the signaling
//! relay for peers that cannot reach each other directly, and the sync
//! engine that couples local CRDT mutations to the wire.

pub mod envelope;
pub mod error;
pub mod peer;
pub mod signaling;
pub mod sync;
pub mod transport;

pub use envelope::{MessageType, PeerEnvelope};
pub use error::NetworkError;
pub use peer::{Peer, PeerTable};
pub use signaling::{SignalFrame, SignalKind, SignalingRelay};
pub use sync::{SyncEngine, SyncState};
pub use transport::{PeerTransport, TransportConfig, TransportStatsSnapshot};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
