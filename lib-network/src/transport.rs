//! Peer transport
//!
//! Two channels per peer: a reliable TCP stream carrying length-prefixed
//! JSON envelopes for application traffic, and a UDP datagram socket for
//! discovery and heartbeats. A handshake frame opens every stream; the
//! acceptor records the peer from that frame. Socket errors are never fatal
//! to the node: they demote the peer to disconnected and schedule a
//! reconnect with exponential backoff.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use lib_crdt::NodeId;
use lib_crypto::{CryptoProvider, Keystore};
use lib_dht::PeerRecord;

use crate::envelope::{MessageType, PeerEnvelope};
use crate::error::NetworkError;
use crate::now_millis;
use crate::peer::PeerTable;

/// Largest accepted stream frame. Anything bigger is treated as a protocol
/// violation and drops the connection.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub port: u16,
    pub max_peers: usize,
    pub heartbeat_interval_ms: u64,
    /// Base delay for the exponential reconnect backoff.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 4411,
            max_peers: 64,
            heartbeat_interval_ms: 10_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 10,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default)]
struct TransportStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped_bad_signature: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dropped_bad_signature: u64,
    pub peers: usize,
    pub connected_peers: usize,
}

pub struct PeerTransport {
    node_id: NodeId,
    config: TransportConfig,
    provider: Arc<CryptoProvider>,
    /// Outbound envelopes are signed when key material is loaded.
    keystore: Option<Arc<parking_lot::RwLock<Keystore>>>,
    peers: RwLock<PeerTable>,
    handlers: RwLock<HashMap<MessageType, mpsc::UnboundedSender<PeerEnvelope>>>,
    udp: RwLock<Option<Arc<UdpSocket>>>,
    stats: TransportStats,
    shutdown_tx: watch::Sender<bool>,
}

impl PeerTransport {
    pub fn new(
        node_id: NodeId,
        config: TransportConfig,
        provider: Arc<CryptoProvider>,
        keystore: Option<Arc<parking_lot::RwLock<Keystore>>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            node_id,
            peers: RwLock::new(PeerTable::new(config.max_peers)),
            config,
            provider,
            keystore,
            handlers: RwLock::new(HashMap::new()),
            udp: RwLock::new(None),
            stats: TransportStats::default(),
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Subscribe to a message type. Frames of that type arrive on the
    /// returned channel instead of being handled internally.
    pub async fn register_handler(&self, kind: MessageType) -> mpsc::UnboundedReceiver<PeerEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers.write().await.insert(kind, tx);
        rx
    }

    /// Bind the listener and datagram sockets and start the accept,
    /// datagram, and heartbeat tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        let bind_addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        let udp = Arc::new(UdpSocket::bind(&bind_addr).await?);
        *self.udp.write().await = Some(Arc::clone(&udp));

        info!(addr = %bind_addr, "peer transport listening");

        self.spawn_accept_loop(listener);
        self.spawn_datagram_loop(udp);
        self.spawn_heartbeat_loop();
        Ok(())
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let transport = Arc::clone(&transport);
                                tokio::spawn(async move {
                                    if let Err(e) = transport.accept_connection(stream, remote).await {
                                        debug!(remote = %remote, error = %e, "inbound connection closed");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_datagram_loop(self: &Arc<Self>, udp: Arc<UdpSocket>) {
        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                tokio::select! {
                    received = udp.recv_from(&mut buf) => {
                        match received {
                            Ok((len, remote)) => {
                                match serde_json::from_slice::<PeerEnvelope>(&buf[..len]) {
                                    Ok(envelope) => {
                                        transport.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                                        transport.handle_envelope(envelope, Some(remote)).await;
                                    }
                                    Err(e) => debug!(remote = %remote, error = %e, "undecodable datagram"),
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "datagram receive failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval_ms = self.config.heartbeat_interval_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        transport.heartbeat_tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One heartbeat round: ping every connected peer over the datagram
    /// channel, then demote peers quiet past twice the cadence.
    async fn heartbeat_tick(self: &Arc<Self>) {
        let now = now_millis();
        let targets: Vec<(NodeId, String, u16)> = {
            let peers = self.peers.read().await;
            peers
                .snapshot()
                .into_iter()
                .filter(|r| r.connected)
                .map(|r| (r.id, r.address, r.port))
                .collect()
        };

        for (id, address, port) in targets {
            let envelope = self
                .heartbeat_envelope(false, None)
                .to(id.clone());
            if let Err(e) = self.send_datagram_to((address.as_str(), port), &envelope).await {
                debug!(peer = %id, error = %e, "heartbeat send failed");
            }
        }

        let quiet_window = self.config.heartbeat_interval_ms.saturating_mul(2);
        let quiet = {
            let peers = self.peers.read().await;
            peers.quiet_peers(now, quiet_window)
        };
        for id in quiet {
            warn!(peer = %id, "peer missed heartbeats; demoting");
            self.demote_and_reconnect(&id).await;
        }
    }

    fn heartbeat_envelope(&self, reply: bool, origin_timestamp: Option<u64>) -> PeerEnvelope {
        PeerEnvelope::new(
            MessageType::Heartbeat,
            self.node_id.clone(),
            json!({
                "originTimestamp": now_millis(),
                "reply": reply,
                "echoTimestamp": origin_timestamp,
            }),
        )
    }

    fn handshake_envelope(&self) -> PeerEnvelope {
        let public_key = self
            .keystore
            .as_ref()
            .map(|ks| BASE64.encode(&ks.read().current().sign_public));
        PeerEnvelope::new(
            MessageType::Handshake,
            self.node_id.clone(),
            json!({
                "port": self.config.port,
                "version": env!("CARGO_PKG_VERSION"),
                "publicKey": public_key,
            }),
        )
    }

    /// Open an outbound connection: connect with a deadline, introduce
    /// ourselves, and wait for the acceptor's handshake before wiring the
    /// stream tasks.
    pub async fn connect_peer(self: &Arc<Self>, address: &str, port: u16) -> Result<NodeId, NetworkError> {
        if self.is_shutting_down() {
            return Err(NetworkError::ShuttingDown);
        }

        let deadline = Duration::from_millis(self.config.connect_timeout_ms);
        let mut stream = timeout(deadline, TcpStream::connect((address, port)))
            .await
            .map_err(|_| NetworkError::Timeout(deadline))??;

        let mut hello = self.handshake_envelope();
        self.sign_envelope(&mut hello)?;
        write_frame(&mut stream, &hello).await?;

        let reply = timeout(deadline, read_frame(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout(deadline))??
            .ok_or_else(|| {
                NetworkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                ))
            })?;

        if reply.kind != MessageType::Handshake {
            return Err(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected handshake frame",
            )));
        }

        let record = self.record_from_handshake(&reply, address.to_string());
        let peer_id = record.id.clone();
        self.attach_stream(record, stream).await?;
        info!(peer = %peer_id, address, port, "outbound peer connected");
        Ok(peer_id)
    }

    /// Inbound path: the first frame must be the peer's handshake; we reply
    /// with ours and wire the stream tasks.
    async fn accept_connection(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) -> Result<(), NetworkError> {
        let deadline = Duration::from_millis(self.config.connect_timeout_ms);
        let hello = timeout(deadline, read_frame(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout(deadline))??
            .ok_or_else(|| {
                NetworkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before handshake",
                ))
            })?;

        if hello.kind != MessageType::Handshake {
            return Err(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected handshake frame",
            )));
        }

        let mut reply = self.handshake_envelope();
        self.sign_envelope(&mut reply)?;
        write_frame(&mut stream, &reply).await?;

        let record = self.record_from_handshake(&hello, remote.ip().to_string());
        let peer_id = record.id.clone();
        self.attach_stream(record, stream).await?;
        info!(peer = %peer_id, remote = %remote, "inbound peer connected");
        Ok(())
    }

    fn record_from_handshake(&self, envelope: &PeerEnvelope, address: String) -> PeerRecord {
        let port = envelope.data["port"].as_u64().unwrap_or(0) as u16;
        let mut record = PeerRecord::new(envelope.from_node_id.clone(), address, port, now_millis());
        record.connected = true;
        if let Some(version) = envelope.data["version"].as_str() {
            record.version = version.to_string();
        }
        if let Some(pk) = envelope.data["publicKey"].as_str() {
            if let Ok(bytes) = BASE64.decode(pk) {
                record.public_key = Some(bytes);
            }
        }
        record
    }

    /// Register the peer (respecting the peer cap) and start its reader and
    /// writer tasks.
    async fn attach_stream(self: &Arc<Self>, record: PeerRecord, stream: TcpStream) -> Result<(), NetworkError> {
        let peer_id = record.id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut peers = self.peers.write().await;
            peers.upsert(record)?;
            peers.mark_connected(&peer_id, tx, now_millis());
        }

        let (read_half, write_half) = stream.into_split();
        self.spawn_writer(peer_id.clone(), write_half, rx);
        self.spawn_reader(peer_id, read_half);
        Ok(())
    }

    fn spawn_writer(
        self: &Arc<Self>,
        peer_id: NodeId,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<PeerEnvelope>,
    ) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match write_frame(&mut write_half, &envelope).await {
                    Ok(written) => {
                        transport.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                        transport.stats.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "stream write failed");
                        transport.demote_and_reconnect(&peer_id).await;
                        break;
                    }
                }
            }
        });
    }

    fn spawn_reader(self: &Arc<Self>, peer_id: NodeId, mut read_half: OwnedReadHalf) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(envelope)) => {
                        transport.handle_envelope(envelope, None).await;
                    }
                    Ok(None) => {
                        debug!(peer = %peer_id, "stream closed by peer");
                        transport.demote_and_reconnect(&peer_id).await;
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "stream read failed");
                        transport.demote_and_reconnect(&peer_id).await;
                        break;
                    }
                }
            }
        });
    }

    /// Central inbound dispatch for both channels.
    async fn handle_envelope(self: &Arc<Self>, envelope: PeerEnvelope, remote: Option<SocketAddr>) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        // Verify the signature whenever we know the sender's key. Unsigned
        // frames from known-keyed peers are also dropped.
        let known_key = {
            let peers = self.peers.read().await;
            peers
                .get(&envelope.from_node_id)
                .and_then(|p| p.record.public_key.clone())
        };
        if let Some(key) = known_key {
            let valid = envelope.verify(&self.provider, &key).unwrap_or(false);
            if !valid && envelope.kind != MessageType::Handshake {
                self.stats.dropped_bad_signature.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %envelope.from_node_id, kind = ?envelope.kind, "dropping frame with bad signature");
                return;
            }
        }

        {
            let mut peers = self.peers.write().await;
            peers.touch(&envelope.from_node_id, now_millis());
        }

        match envelope.kind {
            MessageType::Handshake => {
                // Datagram-path handshakes refresh the table
                let address = remote
                    .map(|r| r.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let record = self.record_from_handshake(&envelope, address);
                if let Err(e) = self.peers.write().await.upsert(record) {
                    warn!(peer = %envelope.from_node_id, error = %e, "handshake rejected");
                }
            }
            MessageType::Heartbeat => {
                self.handle_heartbeat(envelope, remote).await;
            }
            kind => {
                let handlers = self.handlers.read().await;
                match handlers.get(&kind) {
                    Some(tx) => {
                        if tx.send(envelope).is_err() {
                            debug!(kind = ?kind, "handler channel closed");
                        }
                    }
                    None => debug!(kind = ?kind, "no handler registered; frame dropped"),
                }
            }
        }
    }

    async fn handle_heartbeat(self: &Arc<Self>, envelope: PeerEnvelope, remote: Option<SocketAddr>) {
        let now = now_millis();
        let origin = envelope.data["originTimestamp"].as_u64();
        if let Some(ts) = origin {
            let latency = now.saturating_sub(ts);
            self.peers.write().await.update_latency(&envelope.from_node_id, latency);
        }

        let is_reply = envelope.data["reply"].as_bool().unwrap_or(false);
        if is_reply {
            return;
        }

        let reply = self
            .heartbeat_envelope(true, origin)
            .to(envelope.from_node_id.clone());
        match remote {
            Some(addr) => {
                if let Err(e) = self.send_datagram_to(addr, &reply).await {
                    debug!(error = %e, "heartbeat reply failed");
                }
            }
            None => {
                let _ = self.send_to(&envelope.from_node_id, reply).await;
            }
        }
    }

    fn sign_envelope(&self, envelope: &mut PeerEnvelope) -> Result<(), NetworkError> {
        if let Some(keystore) = &self.keystore {
            let keystore = keystore.read();
            envelope.sign(&self.provider, keystore.current().sign_secret())?;
        }
        Ok(())
    }

    /// Send one envelope over a peer's stream channel.
    pub async fn send_to(&self, peer: &NodeId, mut envelope: PeerEnvelope) -> Result<(), NetworkError> {
        if self.is_shutting_down() {
            return Err(NetworkError::ShuttingDown);
        }
        self.sign_envelope(&mut envelope)?;

        let sender = {
            let peers = self.peers.read().await;
            peers.sender_for(peer)
        };
        sender
            .ok_or_else(|| NetworkError::PeerNotFound(peer.to_string()))?
            .send(envelope)
            .map_err(|_| NetworkError::PeerNotFound(peer.to_string()))
    }

    /// Fan an envelope out to every connected peer. Returns the number of
    /// peers it was queued to.
    pub async fn broadcast(&self, mut envelope: PeerEnvelope) -> Result<usize, NetworkError> {
        if self.is_shutting_down() {
            return Err(NetworkError::ShuttingDown);
        }
        self.sign_envelope(&mut envelope)?;

        let senders = {
            let peers = self.peers.read().await;
            peers.connected_senders()
        };
        let mut delivered = 0;
        for (_, sender) in senders {
            if sender.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn send_datagram_to<A: tokio::net::ToSocketAddrs>(
        &self,
        addr: A,
        envelope: &PeerEnvelope,
    ) -> Result<(), NetworkError> {
        let udp = {
            let guard = self.udp.read().await;
            guard.clone()
        };
        let Some(udp) = udp else {
            return Err(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "datagram socket not bound",
            )));
        };
        let mut signed = envelope.clone();
        self.sign_envelope(&mut signed)?;
        let bytes = serde_json::to_vec(&signed)?;
        udp.send_to(&bytes, addr).await?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Demote a peer to disconnected and start the backoff reconnect task.
    async fn demote_and_reconnect(self: &Arc<Self>, peer_id: &NodeId) {
        let attempt = {
            let mut peers = self.peers.write().await;
            peers.mark_disconnected(peer_id)
        };
        if attempt.is_some() && !self.is_shutting_down() {
            self.spawn_reconnect(peer_id.clone());
        }
    }

    /// Reconnect with `delay = min(base * 2^attempts, 60 s)` until the peer
    /// answers or the attempt budget is spent.
    fn spawn_reconnect(self: &Arc<Self>, peer_id: NodeId) {
        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let (attempts, address, port, delay_ms) = {
                    let peers = transport.peers.read().await;
                    let Some(peer) = peers.get(&peer_id) else { return };
                    if peer.is_connected() {
                        return;
                    }
                    (
                        peer.reconnect_attempts,
                        peer.record.address.clone(),
                        peer.record.port,
                        peer.next_backoff_ms(transport.config.reconnect_delay_ms),
                    )
                };

                if attempts > transport.config.max_reconnect_attempts {
                    info!(peer = %peer_id, attempts, "reconnect budget spent; giving up");
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }

                match transport.connect_peer(&address, port).await {
                    Ok(_) => {
                        info!(peer = %peer_id, "reconnected");
                        return;
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, attempts, error = %e, "reconnect attempt failed");
                        let mut peers = transport.peers.write().await;
                        peers.mark_disconnected(&peer_id);
                    }
                }
            }
        });
    }

    pub async fn peer_snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().await.snapshot()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> TransportStatsSnapshot {
        let peers = self.peers.read().await;
        TransportStatsSnapshot {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            dropped_bad_signature: self.stats.dropped_bad_signature.load(Ordering::Relaxed),
            peers: peers.len(),
            connected_peers: peers.connected_count(),
        }
    }

    /// Idempotent shutdown: flips the signal, drops every stream writer.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let mut peers = self.peers.write().await;
        let ids: Vec<NodeId> = peers.snapshot().into_iter().map(|r| r.id).collect();
        for id in ids {
            peers.mark_disconnected(&id);
        }
        info!("peer transport shut down");
    }

    /// Append raw data for a handler round-trip (testing aid).
    pub fn build_envelope(&self, kind: MessageType, data: Value) -> PeerEnvelope {
        PeerEnvelope::new(kind, self.node_id.clone(), data)
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, envelope: &PeerEnvelope) -> Result<usize, NetworkError> {
    let bytes = serde_json::to_vec(envelope)?;
    let len = bytes.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds size cap",
        )));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len() + 4)
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<PeerEnvelope>, NetworkError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds size cap",
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_transport(seed: char, port: u16) -> Arc<PeerTransport> {
        let node_id = NodeId::normalize(&seed.to_string().repeat(64)).unwrap();
        let provider = Arc::new(CryptoProvider::classical_fallback());
        let keystore = Arc::new(parking_lot::RwLock::new(
            Keystore::generate(&provider, 0).unwrap(),
        ));
        PeerTransport::new(
            node_id,
            TransportConfig {
                port,
                heartbeat_interval_ms: 200,
                ..Default::default()
            },
            provider,
            Some(keystore),
        )
    }

    #[tokio::test]
    async fn handshake_establishes_both_directions() {
        let a = test_transport('a', 24811);
        let b = test_transport('b', 24812);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let peer_id = a.connect_peer("127.0.0.1", 24812).await.unwrap();
        assert_eq!(peer_id, *b.node_id());

        // Give the acceptor a beat to register the initiator
        tokio::time::sleep(Duration::from_millis(100)).await;
        let b_peers = b.peer_snapshot().await;
        assert!(b_peers.iter().any(|p| p.id == *a.node_id() && p.connected));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn data_frames_reach_registered_handler() {
        let a = test_transport('a', 24821);
        let b = test_transport('b', 24822);
        a.start().await.unwrap();
        b.start().await.unwrap();
        let mut data_rx = b.register_handler(MessageType::Data).await;

        let peer_id = a.connect_peer("127.0.0.1", 24822).await.unwrap();
        let envelope = a.build_envelope(MessageType::Data, json!({"payload": "hi"}));
        a.send_to(&peer_id, envelope).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.data["payload"], "hi");
        assert_eq!(received.from_node_id, *a.node_id());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn connect_to_dead_port_times_out_or_refuses() {
        let a = test_transport('a', 24831);
        // No listener on the target port; either immediate refusal or timeout
        let result = a.connect_peer("127.0.0.1", 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_sends() {
        let a = test_transport('a', 24841);
        a.start().await.unwrap();

        a.shutdown().await;
        a.shutdown().await;

        let envelope = a.build_envelope(MessageType::Data, json!({}));
        assert!(matches!(
            a.broadcast(envelope).await,
            Err(NetworkError::ShuttingDown)
        ));
    }
}
