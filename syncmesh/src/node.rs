//! Node runtime
//!
//! Builds every subsystem in dependency order, wires the message routing
//! between them, owns the periodic tasks, and tears everything down in
//! reverse order on shutdown. Construction is side-effect free apart from
//! opening the storage tree; nothing listens until [`Node::start`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock as SyncRwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lib_crdt::{CrdtReplica, NodeId, Operation, ReplicaConfig, VectorClock};
use lib_crypto::{CryptoProvider, Keystore};
use lib_dht::RoutingTable;
use lib_network::{
    MessageType, PeerEnvelope, PeerTransport, SignalingRelay, SyncEngine, TransportConfig,
};
use lib_push::{default_cadence_ms, PushHub};
use lib_storage::{MultiTierCache, PutOptions, SharedCache, StoreConfig, TieredStore};

use crate::config::NodeConfig;
use crate::logbuf::LogBuffer;
use crate::providers::{LogsProvider, MetricsProvider, PeersProvider, SyncProvider};

/// Reserved storage key holding the serialized replica between runs.
const REPLICA_STATE_KEY: &str = "system/replica-state";

pub struct Node {
    pub config: NodeConfig,
    pub node_id: NodeId,
    pub crypto: Arc<CryptoProvider>,
    pub keystore: Arc<SyncRwLock<Keystore>>,
    pub replica: Arc<CrdtReplica>,
    pub store: Arc<TieredStore>,
    pub cache: SharedCache,
    pub dht: Arc<SyncRwLock<RoutingTable>>,
    pub transport: Arc<PeerTransport>,
    pub sync: Arc<SyncEngine>,
    pub relay: Arc<SignalingRelay>,
    pub push: Arc<PushHub>,
    pub logs: Arc<LogBuffer>,
    alerts_tx: mpsc::UnboundedSender<Value>,
    alerts_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Assemble every subsystem, leaves first. Restores the replica from
    /// the tiered store when a previous run left one.
    pub async fn build(config: NodeConfig, logs: Arc<LogBuffer>) -> Result<Arc<Self>> {
        config.validate()?;

        let node_id = resolve_node_id(&config)?;
        info!(node = %node_id, "building node");

        let crypto = Arc::new(build_provider(&config)?);
        if !crypto.is_production_grade() {
            warn!("running on the classical fallback provider; NOT quantum-safe");
        }
        let keystore = Arc::new(SyncRwLock::new(
            Keystore::generate(&crypto, config.crypto.key_rotation_interval_ms)
                .context("generating node keys")?,
        ));

        let store = Arc::new(
            TieredStore::open(StoreConfig {
                db_path: config.storage.db_path.clone(),
                max_local_size: config.storage.max_local_size,
                compression_enabled: config.storage.compression_enabled,
                cache_size: config.storage.cache_size,
                sweep_interval_ms: config.storage.cache_sweep_interval_ms,
            })
            .await
            .context("opening tiered store")?,
        );

        let replica_config = ReplicaConfig {
            max_operations: config.crdt.max_operations,
            tombstone_lifetime_ms: config.crdt.tombstone_lifetime_ms,
            garbage_collection_interval_ms: config.crdt.garbage_collection_interval_ms,
        };
        let replica = Arc::new(restore_replica(&store, &node_id, replica_config).await);

        let cache = MultiTierCache::new(
            config.storage.cache_l1_entries,
            config.storage.cache_l2_entries,
        )
        .into_shared();

        let dht = Arc::new(SyncRwLock::new(RoutingTable::new(
            node_id.clone(),
            lib_dht::DEFAULT_K,
        )));

        let transport = PeerTransport::new(
            node_id.clone(),
            TransportConfig {
                port: config.p2p.port,
                max_peers: config.p2p.max_peers,
                heartbeat_interval_ms: config.p2p.heartbeat_interval_ms,
                reconnect_delay_ms: config.p2p.reconnect_delay_ms,
                max_reconnect_attempts: config.p2p.max_reconnect_attempts,
                connect_timeout_ms: 5_000,
            },
            Arc::clone(&crypto),
            Some(Arc::clone(&keystore)),
        );

        let sync = SyncEngine::new(Arc::clone(&replica));
        let relay = SignalingRelay::new(Arc::clone(&dht));
        let push = PushHub::new();
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new(Self {
            config,
            node_id,
            crypto,
            keystore,
            replica,
            store,
            cache,
            dht,
            transport,
            sync,
            relay,
            push,
            logs,
            alerts_tx,
            alerts_rx: parking_lot::Mutex::new(Some(alerts_rx)),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        node.register_push_channels().await;
        Ok(node)
    }

    async fn register_push_channels(self: &Arc<Self>) {
        let metrics = MetricsProvider::new(
            self.config.monitoring.alert_thresholds.clone(),
            self.config.monitoring.history_retention,
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            Arc::clone(&self.transport),
            self.alerts_tx.clone(),
        );
        self.push
            .register_channel(
                "metrics",
                self.config.monitoring.update_interval_ms.max(1),
                metrics,
            )
            .await;
        self.push
            .register_channel(
                "peers",
                default_cadence_ms("peers"),
                PeersProvider::new(Arc::clone(&self.transport)),
            )
            .await;
        self.push
            .register_channel(
                "sync",
                default_cadence_ms("sync"),
                SyncProvider::new(Arc::clone(&self.sync)),
            )
            .await;
        self.push
            .register_channel(
                "logs",
                default_cadence_ms("logs"),
                LogsProvider::new(Arc::clone(&self.logs), 50),
            )
            .await;
    }

    /// Bring the node online: bind sockets, start the periodic tasks, wire
    /// inbound message routing, and dial the bootstrap seeds.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transport.start().await?;

        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock();
        tasks.push(self.replica.spawn_gc(shutdown.clone()));
        tasks.push(self.store.spawn_sweeper(shutdown.clone()));
        tasks.push(MultiTierCache::spawn_sweeper(
            Arc::clone(&self.cache),
            self.config.storage.cache_sweep_interval_ms,
            shutdown.clone(),
        ));
        tasks.push(
            self.sync
                .spawn_ticker(self.config.crdt.sync_interval_ms, shutdown.clone()),
        );
        tasks.push(self.relay.spawn_keepalive());
        tasks.push(self.push.spawn_ping_task());
        drop(tasks);

        self.spawn_sync_routing().await;
        self.spawn_broadcast_pump();
        self.spawn_alert_pump();
        self.spawn_key_rotation();
        self.bootstrap().await;

        info!(node = %self.node_id, "node started");
        Ok(())
    }

    /// Route inbound CRDT and sync frames between transport and sync engine.
    async fn spawn_sync_routing(self: &Arc<Self>) {
        let mut crdt_rx = self.transport.register_handler(MessageType::CrdtOp).await;
        let mut sync_rx = self.transport.register_handler(MessageType::Sync).await;
        let mut sync_resp_rx = self
            .transport
            .register_handler(MessageType::SyncResponse)
            .await;

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(envelope) = crdt_rx.recv() => {
                        node.apply_ops_envelope(&envelope);
                    }
                    Some(envelope) = sync_resp_rx.recv() => {
                        node.apply_ops_envelope(&envelope);
                    }
                    Some(envelope) = sync_rx.recv() => {
                        node.answer_sync_request(envelope).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    else => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn apply_ops_envelope(&self, envelope: &PeerEnvelope) {
        let ops: Vec<Operation> = match serde_json::from_value(envelope.data["ops"].clone()) {
            Ok(ops) => ops,
            Err(e) => {
                warn!(from = %envelope.from_node_id, error = %e, "undecodable operation batch");
                return;
            }
        };
        let report = self.sync.apply_remote_changes(&ops, &envelope.from_node_id);
        debug!(
            from = %envelope.from_node_id,
            applied = report.applied,
            rejected = report.rejected,
            "remote operations merged"
        );
    }

    /// Answer a `SYNC` request with every change the requester has not seen.
    async fn answer_sync_request(&self, envelope: PeerEnvelope) {
        let since = envelope
            .vector_clock
            .clone()
            .or_else(|| serde_json::from_value(envelope.data["vectorClock"].clone()).ok())
            .unwrap_or_else(VectorClock::new);

        let ops = self.sync.changes_since(&since);
        let reply = PeerEnvelope::new(
            MessageType::SyncResponse,
            self.node_id.clone(),
            json!({ "ops": ops }),
        )
        .to(envelope.from_node_id.clone());

        if let Err(e) = self.transport.send_to(&envelope.from_node_id, reply).await {
            debug!(peer = %envelope.from_node_id, error = %e, "sync response failed");
            self.sync.record_transport_error();
        }
    }

    /// Drain pending operations onto the wire on the sync cadence.
    fn spawn_broadcast_pump(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.config.crdt.sync_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        node.flush_pending().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// One broadcast round; public so callers can force an immediate flush.
    pub async fn flush_pending(&self) {
        let ops = self.sync.broadcast_changes();
        if ops.is_empty() {
            return;
        }
        let envelope = PeerEnvelope::new(
            MessageType::CrdtOp,
            self.node_id.clone(),
            json!({ "ops": ops }),
        )
        .with_vector_clock(self.replica.current_vector_clock());

        match self.transport.broadcast(envelope).await {
            Ok(delivered) => debug!(peers = delivered, "operations broadcast"),
            Err(e) => {
                warn!(error = %e, "broadcast failed");
                self.sync.record_transport_error();
            }
        }
    }

    /// Forward threshold alerts from the metrics provider to every push
    /// client.
    fn spawn_alert_pump(self: &Arc<Self>) {
        let Some(mut alerts_rx) = self.alerts_rx.lock().take() else {
            return;
        };
        let push = Arc::clone(&self.push);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    alert = alerts_rx.recv() => {
                        match alert {
                            Some(alert) => push.send_alert(alert).await,
                            None => break,
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
        self.tasks.lock().push(handle);
    }

    fn spawn_key_rotation(self: &Arc<Self>) {
        if self.config.crypto.key_rotation_interval_ms == 0 {
            return;
        }
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let due = node.keystore.read().rotation_due(lib_crdt::now_millis());
                        if due {
                            match node.keystore.write().rotate(&node.crypto) {
                                Ok(epoch) => info!(epoch, "node keys rotated"),
                                Err(e) => warn!(error = %e, "key rotation failed"),
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
        self.tasks.lock().push(handle);
    }

    /// Seed the routing table and dial each bootstrap node.
    async fn bootstrap(self: &Arc<Self>) {
        let seeds = self.config.p2p.bootstrap_nodes.clone();
        if seeds.is_empty() {
            return;
        }

        match self.dht.write().bootstrap(&seeds, lib_crdt::now_millis()) {
            Ok(inserted) => info!(inserted, "routing table bootstrapped"),
            Err(e) => warn!(error = %e, "bootstrap seeding failed"),
        }

        for seed in seeds {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                match transport.connect_peer(&seed.address, seed.port).await {
                    Ok(peer) => info!(peer = %peer, "bootstrap peer connected"),
                    Err(e) => {
                        debug!(address = %seed.address, port = seed.port, error = %e, "bootstrap dial failed")
                    }
                }
            });
        }
    }

    /// Write a value into the replicated map and queue it for broadcast.
    pub fn set(&self, key: &str, value: Value) -> Result<Operation> {
        let op = self.replica.set(key, value)?;
        self.sync.track_change(op.clone());
        Ok(op)
    }

    /// Read through the replica.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.replica.get(key)
    }

    /// Delete a key and queue the tombstone for broadcast.
    pub fn delete(&self, key: &str) -> Result<Operation> {
        let op = self.replica.delete(key)?;
        self.sync.track_change(op.clone());
        Ok(op)
    }

    /// Graceful shutdown, reverse-startup order, idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(node = %self.node_id, "shutting down");

        self.push.shutdown().await;
        self.relay.shutdown().await;
        self.transport.shutdown().await;

        // Flush the replica to disk so the next run resumes where we left
        if let Ok(serialized) = self.replica.serialize() {
            if let Err(e) = self
                .store
                .put(REPLICA_STATE_KEY, &Value::String(serialized), PutOptions::default())
                .await
            {
                warn!(error = %e, "replica flush failed");
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("node stopped");
    }
}

fn resolve_node_id(config: &NodeConfig) -> Result<NodeId> {
    match &config.node_id {
        Some(raw) => Ok(NodeId::normalize(raw)?),
        None => {
            // Persist the auto-assigned identity next to the data tree
            let path = config.storage.db_path.join("node_id");
            if let Ok(existing) = std::fs::read_to_string(&path) {
                if let Ok(id) = NodeId::normalize(existing.trim()) {
                    return Ok(id);
                }
            }
            let id = NodeId::random();
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&path, id.as_str()) {
                warn!(error = %e, "could not persist node identity");
            }
            Ok(id)
        }
    }
}

fn build_provider(config: &NodeConfig) -> Result<CryptoProvider> {
    if config.crypto.use_fallback {
        Ok(CryptoProvider::classical_fallback())
    } else {
        Ok(CryptoProvider::post_quantum(
            config.crypto.kyber_key_size,
            config.crypto.dilithium_key_size,
        )?)
    }
}

async fn restore_replica(store: &TieredStore, node_id: &NodeId, config: ReplicaConfig) -> CrdtReplica {
    if let Ok(Some(Value::String(serialized))) = store.get(REPLICA_STATE_KEY).await {
        match CrdtReplica::deserialize(&serialized, config.clone()) {
            Ok(replica) if replica.node_id() == node_id => {
                info!(
                    keys = replica.stats().keys,
                    "replica restored from storage"
                );
                return replica;
            }
            Ok(_) => warn!("stored replica belongs to a different identity; starting fresh"),
            Err(e) => warn!(error = %e, "stored replica unreadable; starting fresh"),
        }
    }
    CrdtReplica::new(node_id.clone(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, port: u16) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.storage.db_path = dir.path().to_path_buf();
        config.p2p.port = port;
        config.p2p.signaling_port = port + 1;
        config.crypto.use_fallback = true; // keep node tests fast
        config.crypto.key_rotation_interval_ms = 0;
        config
    }

    #[tokio::test]
    async fn build_set_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let logs = LogBuffer::new(64);
        let node = Node::build(test_config(&dir, 25911), logs).await.unwrap();

        node.set("doc/title", json!("hello")).unwrap();
        assert_eq!(node.get("doc/title"), Some(json!("hello")));
        assert_eq!(node.sync.state(), lib_network::SyncState::Pending);
    }

    #[tokio::test]
    async fn identity_persists_across_builds() {
        let dir = TempDir::new().unwrap();
        let logs = LogBuffer::new(64);

        let first = Node::build(test_config(&dir, 25921), logs.clone()).await.unwrap();
        let id = first.node_id.clone();
        first.shutdown().await;

        let second = Node::build(test_config(&dir, 25922), LogBuffer::new(64))
            .await
            .unwrap();
        assert_eq!(second.node_id, id);
    }

    #[tokio::test]
    async fn replica_survives_shutdown_and_rebuild() {
        let dir = TempDir::new().unwrap();

        let node = Node::build(test_config(&dir, 25931), LogBuffer::new(64))
            .await
            .unwrap();
        node.set("persisted", json!(42)).unwrap();
        node.shutdown().await;

        let reborn = Node::build(test_config(&dir, 25932), LogBuffer::new(64))
            .await
            .unwrap();
        assert_eq!(reborn.get("persisted"), Some(json!(42)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let node = Node::build(test_config(&dir, 25941), LogBuffer::new(64))
            .await
            .unwrap();
        node.shutdown().await;
        node.shutdown().await;
    }
}
