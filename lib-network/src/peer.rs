//! Peer table
//!
//! One entry per known peer, whether or not a connection is currently up.
//! The table owns the per-peer stream sender handle and the reconnect
//! attempt counter the backoff schedule reads.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use lib_crdt::NodeId;
use lib_dht::PeerRecord;

use crate::envelope::PeerEnvelope;
use crate::error::NetworkError;

/// Ceiling for the exponential reconnect backoff.
pub const MAX_BACKOFF_MS: u64 = 60_000;

#[derive(Debug)]
pub struct Peer {
    pub record: PeerRecord,
    /// Consecutive failed reconnects; reset on a successful connect.
    pub reconnect_attempts: u32,
    /// Handle into the peer's stream writer task while connected.
    sender: Option<mpsc::UnboundedSender<PeerEnvelope>>,
}

impl Peer {
    pub fn new(record: PeerRecord) -> Self {
        Self {
            record,
            reconnect_attempts: 0,
            sender: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.record.connected
    }

    /// Exponential backoff for the next reconnect attempt, capped at
    /// [`MAX_BACKOFF_MS`].
    pub fn next_backoff_ms(&self, base_ms: u64) -> u64 {
        let factor = 1u64.checked_shl(self.reconnect_attempts).unwrap_or(u64::MAX);
        base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
    }
}

#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<NodeId, Peer>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    /// Insert or refresh a peer record. New peers above the cap are
    /// rejected with `PeerLimit`.
    pub fn upsert(&mut self, record: PeerRecord) -> Result<&mut Peer, NetworkError> {
        if !self.peers.contains_key(&record.id) && self.peers.len() >= self.max_peers {
            return Err(NetworkError::PeerLimit(self.max_peers));
        }
        let entry = self
            .peers
            .entry(record.id.clone())
            .or_insert_with(|| Peer::new(record.clone()));
        entry.record.address = record.address;
        entry.record.port = record.port;
        if record.public_key.is_some() {
            entry.record.public_key = record.public_key;
        }
        entry.record.last_seen = entry.record.last_seen.max(record.last_seen);
        Ok(entry)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Attach the stream writer for a now-live connection.
    pub fn mark_connected(&mut self, id: &NodeId, sender: mpsc::UnboundedSender<PeerEnvelope>, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.record.connected = true;
            peer.record.last_seen = now_ms;
            peer.reconnect_attempts = 0;
            peer.sender = Some(sender);
            debug!(peer = %id, "peer connected");
        }
    }

    /// Drop the writer and flag the peer disconnected. Returns the attempt
    /// count the reconnect schedule should use next.
    pub fn mark_disconnected(&mut self, id: &NodeId) -> Option<u32> {
        let peer = self.peers.get_mut(id)?;
        peer.record.connected = false;
        peer.sender = None;
        peer.reconnect_attempts = peer.reconnect_attempts.saturating_add(1);
        debug!(peer = %id, attempts = peer.reconnect_attempts, "peer disconnected");
        Some(peer.reconnect_attempts)
    }

    pub fn touch(&mut self, id: &NodeId, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.record.last_seen = now_ms;
        }
    }

    pub fn update_latency(&mut self, id: &NodeId, latency_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.record.latency_ms = Some(latency_ms);
        }
    }

    pub fn sender_for(&self, id: &NodeId) -> Option<mpsc::UnboundedSender<PeerEnvelope>> {
        self.peers.get(id).and_then(|p| p.sender.clone())
    }

    pub fn connected_senders(&self) -> Vec<(NodeId, mpsc::UnboundedSender<PeerEnvelope>)> {
        self.peers
            .iter()
            .filter_map(|(id, p)| p.sender.clone().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Peers quiet for longer than `window_ms`, candidates for demotion.
    pub fn quiet_peers(&self, now_ms: u64, window_ms: u64) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.record.connected && now_ms.saturating_sub(p.record.last_seen) > window_ms)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().map(|p| p.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.record.connected).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seed: u8) -> PeerRecord {
        let id = NodeId::normalize(&hex::encode([seed; 32])).unwrap();
        PeerRecord::new(id, "127.0.0.1", 4000 + seed as u16, 0)
    }

    #[test]
    fn peer_limit_rejects_new_peers_only() {
        let mut table = PeerTable::new(2);
        table.upsert(record(1)).unwrap();
        table.upsert(record(2)).unwrap();

        assert!(matches!(
            table.upsert(record(3)),
            Err(NetworkError::PeerLimit(2))
        ));
        // Refreshing a known peer is always allowed
        assert!(table.upsert(record(1)).is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut peer = Peer::new(record(1).clone());
        assert_eq!(peer.next_backoff_ms(1_000), 1_000);
        peer.reconnect_attempts = 3;
        assert_eq!(peer.next_backoff_ms(1_000), 8_000);
        peer.reconnect_attempts = 30;
        assert_eq!(peer.next_backoff_ms(1_000), MAX_BACKOFF_MS);
    }

    #[test]
    fn disconnect_increments_attempts_and_connect_resets() {
        let mut table = PeerTable::new(8);
        let id = record(1).id.clone();
        table.upsert(record(1)).unwrap();

        assert_eq!(table.mark_disconnected(&id), Some(1));
        assert_eq!(table.mark_disconnected(&id), Some(2));

        let (tx, _rx) = mpsc::unbounded_channel();
        table.mark_connected(&id, tx, 42);
        let peer = table.get(&id).unwrap();
        assert!(peer.is_connected());
        assert_eq!(peer.reconnect_attempts, 0);
        assert_eq!(peer.record.last_seen, 42);
    }

    #[test]
    fn quiet_peers_flags_only_connected_and_stale() {
        let mut table = PeerTable::new(8);
        let fresh = record(1);
        let stale = record(2);
        table.upsert(fresh.clone()).unwrap();
        table.upsert(stale.clone()).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        table.mark_connected(&fresh.id, tx.clone(), 10_000);
        table.mark_connected(&stale.id, tx, 1_000);

        let quiet = table.quiet_peers(10_500, 2_000);
        assert_eq!(quiet, vec![stale.id]);
    }
}
