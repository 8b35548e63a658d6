//! Kademlia routing table
//!
//! 160 buckets indexed by the position of the highest differing bit between
//! the local and peer identifiers. Buckets hold up to K peers; a full bucket
//! only replaces its least-recently-seen occupant when that occupant has
//! gone stale.

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::debug;

use lib_crdt::NodeId;

use crate::bucket::KBucket;
use crate::error::DhtError;
use crate::types::{bucket_index, xor_distance, PeerRecord, SeedNode};

/// Standard Kademlia bucket capacity.
pub const DEFAULT_K: usize = 20;

/// A full bucket's least-recently-seen peer must be quiet this long before
/// a newcomer may replace it.
pub const STALE_THRESHOLD_MS: u64 = 60 * 60 * 1_000;

const BUCKET_COUNT: usize = 160;

/// What `add_node` did with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The record was the local node; nothing stored.
    IgnoredSelf,
    /// Already known; moved to most-recently-seen.
    Refreshed,
    /// Appended to a bucket with room.
    Added,
    /// Evicted a stale least-recently-seen occupant.
    Replaced,
    /// Bucket full of fresh peers; newcomer rejected.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStats {
    pub total_nodes: usize,
    pub non_empty_buckets: usize,
    pub full_buckets: usize,
    pub k: usize,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
    k: usize,
    stale_threshold_ms: u64,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            buckets: vec![KBucket::new(); BUCKET_COUNT],
            k,
            stale_threshold_ms: STALE_THRESHOLD_MS,
        }
    }

    /// Override the staleness window; tests shrink it.
    pub fn with_stale_threshold(mut self, threshold_ms: u64) -> Self {
        self.stale_threshold_ms = threshold_ms;
        self
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    fn bucket_for(&self, id: &NodeId) -> Option<usize> {
        bucket_index(&xor_distance(&self.local_id, id))
    }

    /// Insert or refresh a peer record per the k-bucket replacement rule.
    pub fn add_node(&mut self, record: PeerRecord, now_ms: u64) -> AddOutcome {
        let Some(index) = self.bucket_for(&record.id) else {
            return AddOutcome::IgnoredSelf;
        };
        let stale_threshold = self.stale_threshold_ms;
        let k = self.k;
        let bucket = &mut self.buckets[index];

        let mut refreshed = record.clone();
        refreshed.last_seen = now_ms;

        if bucket.touch(refreshed.clone()) {
            return AddOutcome::Refreshed;
        }

        if bucket.len() < k {
            bucket.push(refreshed);
            return AddOutcome::Added;
        }

        let head_is_stale = bucket
            .least_recently_seen()
            .map(|head| now_ms.saturating_sub(head.last_seen) > stale_threshold)
            .unwrap_or(false);

        if head_is_stale {
            let evicted = bucket.pop_front();
            bucket.push(refreshed);
            debug!(
                bucket = index,
                evicted = evicted.as_ref().map(|e| e.id.to_string()).unwrap_or_default(),
                "replaced stale bucket head"
            );
            AddOutcome::Replaced
        } else {
            AddOutcome::Rejected
        }
    }

    /// Up to `count` known nodes sorted ascending by XOR distance to
    /// `target`, never including the local node.
    pub fn find_closest_nodes(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        let mut all: Vec<&PeerRecord> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|n| n.id != self.local_id)
            .collect();
        all.sort_by_key(|n| xor_distance(&n.id, target));
        all.into_iter().take(count).cloned().collect()
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.bucket_for(id)?;
        self.buckets[index].remove(id)
    }

    pub fn lookup_node(&self, id: &NodeId) -> Option<&PeerRecord> {
        let index = self.bucket_for(id)?;
        self.buckets[index].get(id)
    }

    pub fn all_nodes(&self) -> Vec<PeerRecord> {
        self.buckets.iter().flat_map(|b| b.iter()).cloned().collect()
    }

    /// Uniform sample of up to `n` known peers (used by the signaling
    /// relay's peer-list answer).
    pub fn random_nodes(&self, n: usize) -> Vec<PeerRecord> {
        let mut all = self.all_nodes();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(n);
        all
    }

    /// Seed the table from static bootstrap configuration. Seeds without an
    /// identity get one hashed from their endpoint.
    pub fn bootstrap(&mut self, seeds: &[SeedNode], now_ms: u64) -> Result<usize, DhtError> {
        let mut inserted = 0;
        for seed in seeds {
            let id = seed.resolve_id()?;
            let record = PeerRecord::new(id, seed.address.clone(), seed.port, now_ms);
            if matches!(
                self.add_node(record, now_ms),
                AddOutcome::Added | AddOutcome::Replaced | AddOutcome::Refreshed
            ) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map(|b| b.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            total_nodes: self.len(),
            non_empty_buckets: self.buckets.iter().filter(|b| !b.is_empty()).count(),
            full_buckets: self.buckets.iter().filter(|b| b.len() >= self.k).count(),
            k: self.k,
        }
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local_id", &self.local_id)
            .field("nodes", &self.len())
            .field("k", &self.k)
            .finish()
    }
}
