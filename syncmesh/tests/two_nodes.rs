//! End-to-end replication between two live nodes

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use syncmesh::config::NodeConfig;
use syncmesh::logbuf::LogBuffer;
use syncmesh::node::Node;

fn config(dir: &TempDir, port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.storage.db_path = dir.path().to_path_buf();
    config.p2p.port = port;
    config.p2p.signaling_port = port + 1;
    config.p2p.heartbeat_interval_ms = 500;
    config.crdt.sync_interval_ms = 200;
    config.crypto.use_fallback = true;
    config.crypto.key_rotation_interval_ms = 0;
    config
}

async fn build_and_start(dir: &TempDir, port: u16) -> Arc<Node> {
    let node = Node::build(config(dir, port), LogBuffer::new(256))
        .await
        .expect("node builds");
    node.start().await.expect("node starts");
    node
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn set_on_one_node_is_observed_on_the_other() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = build_and_start(&dir_a, 26411).await;
    let b = build_and_start(&dir_b, 26421).await;

    a.transport.connect_peer("127.0.0.1", 26421).await.unwrap();

    a.set("doc/shared", json!({"title": "replicated"})).unwrap();
    a.flush_pending().await;

    let b_reader = Arc::clone(&b);
    wait_for("replication to node b", Duration::from_secs(5), move || {
        b_reader.get("doc/shared") == Some(json!({"title": "replicated"}))
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn causal_delete_propagates() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = build_and_start(&dir_a, 26431).await;
    let b = build_and_start(&dir_b, 26441).await;

    a.transport.connect_peer("127.0.0.1", 26441).await.unwrap();

    a.set("doc/tmp", json!("short-lived")).unwrap();
    a.delete("doc/tmp").unwrap();
    a.flush_pending().await;

    // b must converge to the tombstoned state regardless of batch order
    let b_reader = Arc::clone(&b);
    wait_for("tombstone on node b", Duration::from_secs(5), move || {
        let snapshot = b_reader.replica.snapshot();
        snapshot
            .data
            .get("doc/tmp")
            .map(|e| e.tombstone)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(b.get("doc/tmp"), None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn concurrent_writes_converge_to_the_same_winner() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = build_and_start(&dir_a, 26451).await;
    let b = build_and_start(&dir_b, 26461).await;

    a.transport.connect_peer("127.0.0.1", 26461).await.unwrap();
    // Let b's accept path finish attaching a before either side broadcasts
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Both write before either hears from the other
    a.set("contested", json!("from-a")).unwrap();
    b.set("contested", json!("from-b")).unwrap();
    a.flush_pending().await;
    b.flush_pending().await;

    let (a_reader, b_reader) = (Arc::clone(&a), Arc::clone(&b));
    wait_for("convergence", Duration::from_secs(5), move || {
        let va = a_reader.get("contested");
        let vb = b_reader.get("contested");
        va.is_some() && va == vb
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}
