//! Push channel providers
//!
//! One provider per broadcast channel. Each returns a JSON snapshot on
//! demand; the push hub's per-channel tasks decide when to sample. The
//! metrics provider also checks alert thresholds and emits `ALERT` payloads
//! through an explicit channel rather than holding a handle back into the
//! hub.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::mpsc;

use lib_network::{PeerTransport, SyncEngine};
use lib_push::SnapshotProvider;
use lib_storage::{SharedCache, TieredStore};

use crate::config::AlertThresholds;
use crate::logbuf::LogBuffer;

/// System + subsystem metrics, with threshold alerting.
pub struct MetricsProvider {
    system: Mutex<System>,
    thresholds: AlertThresholds,
    store: Arc<TieredStore>,
    cache: SharedCache,
    transport: Arc<PeerTransport>,
    alerts: mpsc::UnboundedSender<Value>,
    history: Mutex<VecDeque<Value>>,
    history_retention: usize,
}

impl MetricsProvider {
    pub fn new(
        thresholds: AlertThresholds,
        history_retention: usize,
        store: Arc<TieredStore>,
        cache: SharedCache,
        transport: Arc<PeerTransport>,
        alerts: mpsc::UnboundedSender<Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            system: Mutex::new(System::new_all()),
            thresholds,
            store,
            cache,
            transport,
            alerts,
            history: Mutex::new(VecDeque::new()),
            history_retention: history_retention.max(1),
        })
    }

    pub fn history(&self) -> Vec<Value> {
        self.history.lock().iter().cloned().collect()
    }

    fn alert(&self, kind: &str, value: f64, threshold: f64) {
        let _ = self.alerts.send(json!({
            "kind": kind,
            "value": value,
            "threshold": threshold,
        }));
    }
}

#[async_trait]
impl SnapshotProvider for MetricsProvider {
    async fn snapshot(&self) -> Value {
        let (cpu, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = system.global_cpu_usage() as f64;
            let total = system.total_memory().max(1);
            let memory = (system.used_memory() as f64 / total as f64) * 100.0;
            (cpu, memory)
        };

        let storage = self.store.stats().await;
        let disk_percent = if storage.local_total > 0 {
            (storage.local_used as f64 / storage.local_total as f64) * 100.0
        } else {
            0.0
        };

        let transport = self.transport.stats().await;
        let cache = self.cache.lock().stats();
        let worst_latency = self
            .transport
            .peer_snapshot()
            .await
            .iter()
            .filter_map(|p| p.latency_ms)
            .max()
            .unwrap_or(0);

        if cpu > self.thresholds.cpu {
            self.alert("cpu", cpu, self.thresholds.cpu);
        }
        if memory_percent > self.thresholds.memory {
            self.alert("memory", memory_percent, self.thresholds.memory);
        }
        if disk_percent > self.thresholds.disk {
            self.alert("disk", disk_percent, self.thresholds.disk);
        }
        if worst_latency > self.thresholds.network_latency {
            self.alert(
                "networkLatency",
                worst_latency as f64,
                self.thresholds.network_latency as f64,
            );
        }

        let snapshot = json!({
            "cpu": cpu,
            "memory": memory_percent,
            "disk": disk_percent,
            "networkLatency": worst_latency,
            "storage": storage,
            "cache": cache,
            "transport": transport,
        });

        {
            let mut history = self.history.lock();
            if history.len() >= self.history_retention {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }

        snapshot
    }
}

/// Peer table view for the `peers` channel.
pub struct PeersProvider {
    transport: Arc<PeerTransport>,
}

impl PeersProvider {
    pub fn new(transport: Arc<PeerTransport>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

#[async_trait]
impl SnapshotProvider for PeersProvider {
    async fn snapshot(&self) -> Value {
        let peers = self.transport.peer_snapshot().await;
        let connected = peers.iter().filter(|p| p.connected).count();
        json!({
            "peers": peers,
            "connected": connected,
        })
    }
}

/// Sync-engine state for the `sync` channel.
pub struct SyncProvider {
    sync: Arc<SyncEngine>,
}

impl SyncProvider {
    pub fn new(sync: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self { sync })
    }
}

#[async_trait]
impl SnapshotProvider for SyncProvider {
    async fn snapshot(&self) -> Value {
        let stats = self.sync.stats();
        let replica = self.sync.replica().stats();
        json!({
            "sync": stats,
            "replica": replica,
        })
    }
}

/// Recent log lines for the `logs` channel.
pub struct LogsProvider {
    buffer: Arc<LogBuffer>,
    batch: usize,
}

impl LogsProvider {
    pub fn new(buffer: Arc<LogBuffer>, batch: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            batch: batch.max(1),
        })
    }
}

#[async_trait]
impl SnapshotProvider for LogsProvider {
    async fn snapshot(&self) -> Value {
        json!({ "lines": self.buffer.recent(self.batch) })
    }
}
