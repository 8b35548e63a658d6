//! Signaling relay
//!
//! Session-description and candidate forwarding for peers that cannot reach
//! each other directly, plus the peer registry a joining client sees. The
//! relay core is transport-agnostic: a client is an identifier and a frame
//! sink; the node wires actual WebSocket connections to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use lib_crdt::NodeId;
use lib_dht::{PeerRecord, RoutingTable};

use crate::now_millis;

/// Clients quiet past this window are disconnected by the keepalive task.
pub const KEEPALIVE_TIMEOUT_MS: u64 = 60_000;

/// How many random DHT nodes pad a peer-list answer.
const PEER_LIST_DHT_SAMPLE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    PeerJoin,
    PeerLeave,
    PeerList,
    Ping,
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalFrame {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: u64,
}

impl SignalFrame {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            from: None,
            to: None,
            data: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

struct SignalingClient {
    peer_id: String,
    address: String,
    sender: mpsc::UnboundedSender<SignalFrame>,
    last_seen: u64,
}

pub struct SignalingRelay {
    clients: RwLock<HashMap<String, SignalingClient>>,
    dht: Arc<SyncRwLock<RoutingTable>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingRelay {
    pub fn new(dht: Arc<SyncRwLock<RoutingTable>>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            dht,
            shutdown_tx,
        })
    }

    /// Register a new client connection. Assigns a peer identifier, sends
    /// the welcome join frame (carrying the current peer list), broadcasts
    /// the join to everyone else, and records the peer in the DHT once.
    pub async fn register(&self, address: String) -> (String, mpsc::UnboundedReceiver<SignalFrame>) {
        let peer_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let existing: Vec<String> = {
            let mut clients = self.clients.write().await;
            let list = clients.keys().cloned().collect();
            clients.insert(
                peer_id.clone(),
                SignalingClient {
                    peer_id: peer_id.clone(),
                    address: address.clone(),
                    sender: tx.clone(),
                    last_seen: now_millis(),
                },
            );
            list
        };

        // Single DHT registration per connection
        if let Ok(node_id) = NodeId::normalize(&peer_id) {
            let record = PeerRecord::new(node_id, address, 0, now_millis());
            self.dht.write().add_node(record, now_millis());
        }

        let welcome = SignalFrame::new(SignalKind::PeerJoin).with_data(json!({
            "peerId": peer_id,
            "peers": existing,
        }));
        let _ = tx.send(welcome);

        let join = SignalFrame::new(SignalKind::PeerJoin).with_data(json!({ "peerId": peer_id }));
        self.broadcast_except(&peer_id, join).await;

        info!(peer = %peer_id, "signaling client joined");
        (peer_id, rx)
    }

    /// Handle one inbound frame from a connected client.
    pub async fn handle_frame(&self, peer_id: &str, mut frame: SignalFrame) {
        self.touch(peer_id).await;

        match frame.kind {
            SignalKind::Ping => {
                self.send_to(peer_id, SignalFrame::new(SignalKind::Pong)).await;
            }
            SignalKind::PeerList => {
                let frame = self.peer_list_frame().await;
                self.send_to(peer_id, frame).await;
            }
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
                let Some(target) = frame.to.clone() else {
                    debug!(peer = %peer_id, kind = ?frame.kind, "forwarded frame without target");
                    return;
                };
                frame.from = Some(peer_id.to_string());
                if !self.forward(&target, frame).await {
                    debug!(peer = %peer_id, target = %target, "forward target not connected");
                }
            }
            SignalKind::PeerJoin | SignalKind::PeerLeave | SignalKind::Pong => {
                // Server-originated kinds; ignore from clients
            }
        }
    }

    /// Union of the connected registry and a random DHT sample, de-duplicated
    /// by identifier.
    async fn peer_list_frame(&self) -> SignalFrame {
        let connected: Vec<String> = {
            let clients = self.clients.read().await;
            clients.keys().cloned().collect()
        };

        let mut seen: HashSet<String> = connected.iter().cloned().collect();
        let mut peers: Vec<Value> = connected
            .iter()
            .map(|id| json!({ "peerId": id, "connected": true }))
            .collect();

        let sample = self.dht.read().random_nodes(PEER_LIST_DHT_SAMPLE);
        for node in sample {
            let id = node.id.to_string();
            if seen.insert(id.clone()) {
                peers.push(json!({
                    "peerId": id,
                    "address": node.address,
                    "port": node.port,
                    "connected": node.connected,
                }));
            }
        }

        SignalFrame::new(SignalKind::PeerList).with_data(json!({ "peers": peers }))
    }

    async fn forward(&self, target: &str, frame: SignalFrame) -> bool {
        let clients = self.clients.read().await;
        match clients.get(target) {
            Some(client) => client.sender.send(frame).is_ok(),
            None => false,
        }
    }

    async fn send_to(&self, peer_id: &str, frame: SignalFrame) {
        let clients = self.clients.read().await;
        if let Some(client) = clients.get(peer_id) {
            let _ = client.sender.send(frame);
        }
    }

    async fn broadcast_except(&self, except: &str, frame: SignalFrame) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            if client.peer_id != except {
                let _ = client.sender.send(frame.clone());
            }
        }
    }

    async fn touch(&self, peer_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(peer_id) {
            client.last_seen = now_millis();
        }
    }

    /// Drop a client and tell the others.
    pub async fn disconnect(&self, peer_id: &str) {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(peer_id)
        };
        if removed.is_some() {
            let leave = SignalFrame::new(SignalKind::PeerLeave).with_data(json!({ "peerId": peer_id }));
            self.broadcast_except(peer_id, leave).await;
            info!(peer = %peer_id, "signaling client left");
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Disconnect clients quiet for longer than [`KEEPALIVE_TIMEOUT_MS`].
    pub async fn keepalive_sweep(&self, now_ms: u64) -> usize {
        let quiet: Vec<String> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|c| now_ms.saturating_sub(c.last_seen) > KEEPALIVE_TIMEOUT_MS)
                .map(|c| c.peer_id.clone())
                .collect()
        };

        for peer_id in &quiet {
            warn!(peer = %peer_id, "signaling client timed out");
            self.disconnect(peer_id).await;
        }
        quiet.len()
    }

    pub fn spawn_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let relay = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        relay.keepalive_sweep(now_millis()).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Idempotent shutdown; drops every client sink.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.clients.write().await.clear();
        info!("signaling relay shut down");
    }
}
