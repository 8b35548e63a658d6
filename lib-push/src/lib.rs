//! Syncmesh Push Fan-out
//!
//! Named channels (`metrics`, `peers`, `sync`, `logs`, ...) streamed to
//! subscribed clients. Each channel has one broadcast task running at its
//! cadence; the task samples the channel's registered provider and fans the
//! snapshot out to every subscriber. One task per channel plus one ordered
//! sink per connection gives per-(channel, subscriber) delivery order for
//! free; nothing stronger is promised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use std::time::{SystemTime, UNIX_EPOCH};

/// Server ping cadence.
pub const PING_INTERVAL_MS: u64 = 30_000;

/// Connections that have not acknowledged a ping within this window are
/// force-closed.
pub const PONG_TIMEOUT_MS: u64 = 60_000;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default broadcast cadence for a channel name, milliseconds.
pub fn default_cadence_ms(channel: &str) -> u64 {
    match channel {
        "metrics" => 500,
        "sync" => 2_000,
        "logs" => 1_000,
        "peers" => 5_000,
        _ => 1_000,
    }
}

/// Produces the snapshot a channel broadcasts each tick.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Value;
}

/// Frame written to subscribers: the channel name (or a control verb) plus
/// the snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: u64,
}

impl PushFrame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: now_millis(),
        }
    }
}

/// Client-to-server verbs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ping,
    Pong,
}

struct PushConnection {
    id: String,
    sender: mpsc::UnboundedSender<PushFrame>,
    subscriptions: HashSet<String>,
    last_pong: u64,
}

struct ChannelState {
    provider: Arc<dyn SnapshotProvider>,
    cadence_ms: u64,
    /// Broadcast task while the channel has at least one subscriber.
    task: Option<JoinHandle<()>>,
}

pub struct PushHub {
    connections: RwLock<HashMap<String, PushConnection>>,
    channels: RwLock<HashMap<String, ChannelState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PushHub {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Register a channel and its provider. Broadcasting starts lazily with
    /// the first subscriber.
    pub async fn register_channel(
        &self,
        name: impl Into<String>,
        cadence_ms: u64,
        provider: Arc<dyn SnapshotProvider>,
    ) {
        let name = name.into();
        self.channels.write().await.insert(
            name.clone(),
            ChannelState {
                provider,
                cadence_ms,
                task: None,
            },
        );
        debug!(channel = %name, cadence_ms, "push channel registered");
    }

    /// Accept a client connection: assign an identifier, hand back the frame
    /// stream, and greet with a `CONNECTED` welcome.
    pub async fn connect(&self) -> (String, mpsc::UnboundedReceiver<PushFrame>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let welcome = PushFrame::new("CONNECTED", json!({ "connectionId": id }));
        let _ = tx.send(welcome);

        self.connections.write().await.insert(
            id.clone(),
            PushConnection {
                id: id.clone(),
                sender: tx,
                subscriptions: HashSet::new(),
                last_pong: now_millis(),
            },
        );

        info!(connection = %id, "push client connected");
        (id, rx)
    }

    /// Dispatch one parsed client frame.
    pub async fn handle_client_frame(self: &Arc<Self>, connection_id: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::Subscribe { channels } => {
                self.subscribe(connection_id, &channels).await;
            }
            ClientFrame::Unsubscribe { channels } => {
                self.unsubscribe(connection_id, &channels).await;
            }
            ClientFrame::Ping => {
                let connections = self.connections.read().await;
                if let Some(conn) = connections.get(connection_id) {
                    let _ = conn.sender.send(PushFrame::new("PONG", Value::Null));
                }
            }
            ClientFrame::Pong => {
                let mut connections = self.connections.write().await;
                if let Some(conn) = connections.get_mut(connection_id) {
                    conn.last_pong = now_millis();
                }
            }
        }
    }

    /// Add channels to a connection's subscription set, starting broadcast
    /// tasks for channels that were idle.
    pub async fn subscribe(self: &Arc<Self>, connection_id: &str, channels: &[String]) {
        let mut accepted = Vec::new();
        {
            let known = self.channels.read().await;
            let mut connections = self.connections.write().await;
            let Some(conn) = connections.get_mut(connection_id) else {
                return;
            };
            for channel in channels {
                if known.contains_key(channel) {
                    if conn.subscriptions.insert(channel.clone()) {
                        accepted.push(channel.clone());
                    }
                } else {
                    warn!(connection = %connection_id, channel = %channel, "subscribe to unknown channel");
                }
            }
        }

        for channel in accepted {
            self.ensure_broadcaster(&channel).await;
        }
    }

    pub async fn unsubscribe(self: &Arc<Self>, connection_id: &str, channels: &[String]) {
        {
            let mut connections = self.connections.write().await;
            if let Some(conn) = connections.get_mut(connection_id) {
                for channel in channels {
                    conn.subscriptions.remove(channel);
                }
            }
        }
        for channel in channels {
            self.stop_broadcaster_if_idle(channel).await;
        }
    }

    /// Remove a connection and stop any channel it was the last subscriber
    /// of.
    pub async fn disconnect(self: &Arc<Self>, connection_id: &str) {
        let subscriptions = {
            let mut connections = self.connections.write().await;
            connections
                .remove(connection_id)
                .map(|c| c.subscriptions)
                .unwrap_or_default()
        };
        for channel in subscriptions {
            self.stop_broadcaster_if_idle(&channel).await;
        }
        info!(connection = %connection_id, "push client disconnected");
    }

    async fn subscriber_count(&self, channel: &str) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.subscriptions.contains(channel))
            .count()
    }

    async fn ensure_broadcaster(self: &Arc<Self>, channel: &str) {
        let mut channels = self.channels.write().await;
        let Some(state) = channels.get_mut(channel) else {
            return;
        };
        if state.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let hub = Arc::clone(self);
        let name = channel.to_string();
        let provider = Arc::clone(&state.provider);
        let cadence = Duration::from_millis(state.cadence_ms.max(1));
        let mut shutdown = self.shutdown_tx.subscribe();

        state.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Exactly one snapshot per tick, shared by all
                        // subscribers of this channel.
                        let data = provider.snapshot().await;
                        let frame = PushFrame::new(name.clone(), data);
                        let connections = hub.connections.read().await;
                        for conn in connections.values() {
                            if conn.subscriptions.contains(&name) {
                                let _ = conn.sender.send(frame.clone());
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
        }));
        debug!(channel = %channel, "broadcast task started");
    }

    async fn stop_broadcaster_if_idle(&self, channel: &str) {
        if self.subscriber_count(channel).await > 0 {
            return;
        }
        let mut channels = self.channels.write().await;
        if let Some(state) = channels.get_mut(channel) {
            if let Some(task) = state.task.take() {
                task.abort();
                debug!(channel = %channel, "broadcast task stopped (no subscribers)");
            }
        }
    }

    /// Out-of-band alert frame to every connection, subscribed or not.
    pub async fn send_alert(&self, data: Value) {
        let frame = PushFrame::new("ALERT", data);
        let connections = self.connections.read().await;
        for conn in connections.values() {
            let _ = conn.sender.send(frame.clone());
        }
    }

    /// Ping every connection; force-close those whose last acknowledgement
    /// is older than the timeout.
    pub async fn ping_sweep(self: &Arc<Self>, now_ms: u64) -> usize {
        let (stale, live): (Vec<String>, Vec<String>) = {
            let connections = self.connections.read().await;
            let stale = connections
                .values()
                .filter(|c| now_ms.saturating_sub(c.last_pong) > PONG_TIMEOUT_MS)
                .map(|c| c.id.clone())
                .collect();
            let live = connections
                .values()
                .filter(|c| now_ms.saturating_sub(c.last_pong) <= PONG_TIMEOUT_MS)
                .map(|c| c.id.clone())
                .collect();
            (stale, live)
        };

        for id in &stale {
            warn!(connection = %id, "push client missed ping window; closing");
            self.disconnect(id).await;
        }

        let connections = self.connections.read().await;
        for id in live {
            if let Some(conn) = connections.get(&id) {
                let _ = conn.sender.send(PushFrame::new("PING", Value::Null));
            }
        }
        stale.len()
    }

    pub fn spawn_ping_task(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.ping_sweep(now_millis()).await;
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

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Idempotent: stops every broadcaster and drops every connection.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let mut channels = self.channels.write().await;
        for state in channels.values_mut() {
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
        self.connections.write().await.clear();
        info!("push hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingProvider {
        calls: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl SnapshotProvider for CountingProvider {
        async fn snapshot(&self) -> Value {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            json!({ "seq": n })
        }
    }

    fn provider() -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            calls: std::sync::atomic::AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn connect_greets_with_connected_frame() {
        let hub = PushHub::new();
        let (id, mut rx) = hub.connect().await;

        let welcome = rx.recv().await.unwrap();
        assert_eq!(welcome.kind, "CONNECTED");
        assert_eq!(welcome.data["connectionId"], id.as_str());
    }

    #[tokio::test]
    async fn subscriber_receives_frames_in_production_order() {
        let hub = PushHub::new();
        hub.register_channel("metrics", 20, provider()).await;

        let (id, mut rx) = hub.connect().await;
        rx.recv().await.unwrap(); // welcome
        hub.subscribe(&id, &["metrics".to_string()]).await;

        let mut last_seq = None;
        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.kind, "metrics");
            let seq = frame.data["seq"].as_u64().unwrap();
            if let Some(prev) = last_seq {
                assert!(seq > prev, "frames must arrive in production order");
            }
            last_seq = Some(seq);
        }

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn broadcaster_stops_when_last_subscriber_leaves() {
        let hub = PushHub::new();
        let p = provider();
        hub.register_channel("metrics", 10, p.clone()).await;

        let (id, mut rx) = hub.connect().await;
        rx.recv().await.unwrap();
        hub.subscribe(&id, &["metrics".to_string()]).await;

        // Let a few ticks happen, then drop the only subscriber
        tokio::time::sleep(Duration::from_millis(60)).await;
        hub.disconnect(&id).await;

        let calls_at_stop = p.calls.load(std::sync::atomic::Ordering::SeqCst);
        assert!(calls_at_stop > 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Aborted task means no further provider calls
        assert_eq!(p.calls.load(std::sync::atomic::Ordering::SeqCst), calls_at_stop);
    }

    #[tokio::test]
    async fn unsubscribe_removes_channel_only() {
        let hub = PushHub::new();
        hub.register_channel("metrics", 10, provider()).await;
        hub.register_channel("peers", 10, provider()).await;

        let (id, mut rx) = hub.connect().await;
        rx.recv().await.unwrap();
        hub.subscribe(&id, &["metrics".to_string(), "peers".to_string()]).await;
        hub.unsubscribe(&id, &["metrics".to_string()]).await;

        // Drain for a while; only peers frames should arrive
        let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(frame)) => assert_ne!(frame.kind, "metrics"),
                _ => break,
            }
        }
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn ping_sweep_closes_silent_connections() {
        let hub = PushHub::new();
        let (id, mut rx) = hub.connect().await;
        rx.recv().await.unwrap();

        // Fresh connection survives a sweep inside the window
        assert_eq!(hub.ping_sweep(now_millis()).await, 0);
        assert_eq!(hub.connection_count().await, 1);

        // Far-future sweep treats it as silent
        assert_eq!(hub.ping_sweep(now_millis() + PONG_TIMEOUT_MS + 1).await, 1);
        assert_eq!(hub.connection_count().await, 0);
        let _ = id;
    }

    #[tokio::test]
    async fn pong_refreshes_the_window() {
        let hub = PushHub::new();
        let (id, mut rx) = hub.connect().await;
        rx.recv().await.unwrap();

        hub.handle_client_frame(&id, ClientFrame::Pong).await;
        assert_eq!(hub.connection_count().await, 1);

        hub.handle_client_frame(&id, ClientFrame::Ping).await;
        let pong = rx.recv().await.unwrap();
        assert_eq!(pong.kind, "PONG");
    }

    #[tokio::test]
    async fn alert_reaches_every_connection() {
        let hub = PushHub::new();
        let (_a, mut rx_a) = hub.connect().await;
        let (_b, mut rx_b) = hub.connect().await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        hub.send_alert(json!({ "kind": "disk", "value": 97.5 })).await;
        assert_eq!(rx_a.recv().await.unwrap().kind, "ALERT");
        assert_eq!(rx_b.recv().await.unwrap().kind, "ALERT");
    }

    #[tokio::test]
    async fn client_frames_parse_from_wire_form() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"SUBSCRIBE","channels":["metrics","sync"]}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { channels } if channels.len() == 2));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"PONG"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Pong));
    }
}
