//! WebSocket endpoints
//!
//! Two duplex frame channels over one axum server: `/p2p-signaling` wires
//! browsers into the signaling relay, `/realtime` wires them into the push
//! hub. Both handlers are thin adapters: parse inbound text frames, forward
//! outbound frames, tell the core when the socket dies.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use lib_network::SignalFrame;
use lib_push::ClientFrame;

use crate::node::Node;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/p2p-signaling", get(signaling_upgrade))
        .route("/realtime", get(realtime_upgrade))
        .with_state(node)
}

/// Serve the WebSocket endpoints until shutdown.
pub async fn serve(node: Arc<Node>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", node.config.p2p.signaling_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "websocket endpoints listening");

    let app = router(node);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn signaling_upgrade(
    State(node): State<Arc<Node>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling(socket, node, remote))
}

async fn handle_signaling(socket: WebSocket, node: Arc<Node>, remote: SocketAddr) {
    let (peer_id, mut outbound) = node.relay.register(remote.to_string()).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalFrame>(&text) {
                            Ok(frame) => node.relay.handle_frame(&peer_id, frame).await,
                            Err(e) => debug!(peer = %peer_id, error = %e, "undecodable signaling frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(peer = %peer_id, error = %e, "signaling socket error");
                        break;
                    }
                }
            }
        }
    }

    node.relay.disconnect(&peer_id).await;
}

async fn realtime_upgrade(
    State(node): State<Arc<Node>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_realtime(socket, node))
}

async fn handle_realtime(socket: WebSocket, node: Arc<Node>) {
    let (connection_id, mut outbound) = node.push.connect().await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => node.push.handle_client_frame(&connection_id, frame).await,
                            Err(e) => debug!(connection = %connection_id, error = %e, "undecodable client frame"),
                        }
                    }
                    // Transport-level pongs also count as liveness acks
                    Some(Ok(Message::Pong(_))) => {
                        node.push.handle_client_frame(&connection_id, ClientFrame::Pong).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "realtime socket error");
                        break;
                    }
                }
            }
        }
    }

    node.push.disconnect(&connection_id).await;
}
