//! Peer records and bootstrap seeds

use serde::{Deserialize, Serialize};

use lib_crdt::NodeId;

use crate::error::DhtError;

/// What the routing table (and the transport's peer table) knows about a
/// peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub connected: bool,
    /// Round-trip estimate from the heartbeat exchange, millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Wall-clock millis of last contact.
    pub last_seen: u64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
}

impl PeerRecord {
    pub fn new(id: NodeId, address: impl Into<String>, port: u16, last_seen: u64) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            connected: false,
            latency_ms: None,
            last_seen,
            version: env!("CARGO_PKG_VERSION").to_string(),
            public_key: None,
        }
    }

    /// XOR distance to `other` over the full 256-bit identifier space.
    pub fn distance_to(&self, other: &NodeId) -> [u8; 32] {
        xor_distance(&self.id, other)
    }
}

/// Statically configured bootstrap entry. Identity may be omitted, in which
/// case it is derived by hashing `address:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub address: String,
    pub port: u16,
}

impl SeedNode {
    /// Resolve the seed's node identity, hashing the endpoint when no
    /// identity was configured.
    pub fn resolve_id(&self) -> Result<NodeId, DhtError> {
        let raw = match &self.id {
            Some(id) => id.clone(),
            None => format!("{}:{}", self.address, self.port),
        };
        NodeId::normalize(&raw).map_err(|e| DhtError::InvalidNode(e.to_string()))
    }
}

/// Byte-wise XOR of two identifiers. Comparing the resulting arrays
/// lexicographically orders peers by distance.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let (a, b) = (a.to_bytes(), b.to_bytes());
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Bucket index for a distance: the count of leading zero bits in the
/// 160-bit truncation, i.e. `160 - bit_length(distance)`, clamped to 159.
/// Returns `None` for a zero distance (the local node itself).
pub fn bucket_index(distance: &[u8; 32]) -> Option<usize> {
    let mut leading = 0usize;
    for &byte in distance.iter().take(20) {
        if byte == 0 {
            leading += 8;
        } else {
            leading += byte.leading_zeros() as usize;
            return Some(leading.min(159));
        }
    }
    // All of the truncated 160 bits are zero; distinguish true self-distance
    // from identifiers that only differ past the truncation.
    if distance.iter().all(|&b| b == 0) {
        None
    } else {
        Some(159)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_from(bytes: [u8; 32]) -> NodeId {
        NodeId::normalize(&hex::encode(bytes)).unwrap()
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = id_from([0xAA; 32]);
        let b = id_from([0x0F; 32]);
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn bucket_index_tracks_highest_differing_bit() {
        // Top bit differs: bit length 160, index 0
        let mut d = [0u8; 32];
        d[0] = 0x80;
        assert_eq!(bucket_index(&d), Some(0));

        // Lowest truncated bit differs: index 159
        let mut d = [0u8; 32];
        d[19] = 0x01;
        assert_eq!(bucket_index(&d), Some(159));

        // Self distance
        assert_eq!(bucket_index(&[0u8; 32]), None);

        // Differs only past the 160-bit truncation: farthest-capped bucket
        let mut d = [0u8; 32];
        d[31] = 0x01;
        assert_eq!(bucket_index(&d), Some(159));
    }

    #[test]
    fn seed_without_identity_hashes_endpoint() {
        let seed = SeedNode {
            id: None,
            address: "203.0.113.9".into(),
            port: 4411,
        };
        let id = seed.resolve_id().unwrap();
        assert_eq!(id, NodeId::normalize("203.0.113.9:4411").unwrap());
    }
}
