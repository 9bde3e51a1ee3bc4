//! HTTP surface: the WebSocket signaling endpoint and health.
//!
//! The WebSocket bridge is a thin adapter between wire frames and the
//! room actor: inbound request frames are decoded and submitted, reply
//! and notification frames drain from the peer socket's outbound
//! channel in order, and a closed connection becomes a peer disconnect.
//! No room logic lives here.

use crate::access::roles;
use crate::config::Config;
use crate::registry::RegistryHandle;
use crate::room::NewPeer;
use crate::signaling::protocol::{ClientFrame, ReplyError};
use crate::signaling::socket::{socket_pair, OutboundFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::types::{PeerId, RoomId};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub config: Arc<Config>,
}

/// Build the service router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let rooms = state.registry.status().await.unwrap_or_default();
    let peers: usize = rooms.iter().map(|room| room.peer_count).sum();
    Json(json!({
        "status": "ok",
        "rooms": rooms.len(),
        "peers": peers,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    room_id: String,
    peer_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, query, addr, state))
        .into_response()
}

async fn handle_connection(ws: WebSocket, query: WsQuery, addr: SocketAddr, state: AppState) {
    let room_id = RoomId(query.room_id);
    let peer_id = PeerId(query.peer_id);

    let room = match state.registry.get_or_create(room_id.clone()).await {
        Ok(room) => room,
        Err(error) => {
            warn!(target: "server", room_id = %room_id, %error, "room unavailable");
            return;
        }
    };

    let (peer_socket, server_end) = socket_pair(
        peer_id.clone(),
        Duration::from_millis(state.config.request_timeout_ms),
        state.config.request_retries,
    );
    let bridge_socket = peer_socket.clone();
    let resolver = server_end.resolver.clone();
    let mut outbound = server_end.outbound;

    let new_peer = NewPeer {
        peer_id: peer_id.clone(),
        display_name: query
            .display_name
            .unwrap_or_else(|| "Guest".to_string()),
        picture: None,
        from: None,
        roles: vec![roles::NORMAL],
        token: query.token,
        socket: peer_socket,
        client_ip: Some(addr.ip()),
    };
    if let Err(error) = room.handle_peer(new_peer).await {
        warn!(target: "server", room_id = %room_id, peer_id = %peer_id, %error, "admission failed");
        return;
    }

    info!(target: "server", room_id = %room_id, peer_id = %peer_id, "connection established");

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Writer: drain the socket's outbound frames onto the wire in order.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match frame {
                OutboundFrame::Notification(wire) => wire.to_string(),
                OutboundFrame::Request { id, method, data } => {
                    json!({ "request": true, "id": id, "method": method, "data": data }).to_string()
                }
                OutboundFrame::Reply { id, result } => match result {
                    Ok(value) => json!({ "id": id, "result": value }).to_string(),
                    Err(error) => json!({ "id": id, "error": error }).to_string(),
                },
                OutboundFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Reader: decode inbound frames until the connection ends.
    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match ClientFrame::decode(&text) {
            Ok(ClientFrame::Request { id, request }) => {
                if room
                    .submit_request(peer_id.clone(), id, request)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(ClientFrame::BadRequest { id, error }) => {
                debug!(target: "server", peer_id = %peer_id, %error, "bad request frame");
                let wire = serde_json::to_value(ReplyError::from(&error)).unwrap_or(Value::Null);
                bridge_socket.reply(id, Err(wire));
            }
            Ok(ClientFrame::Reply { id, error, result }) => match error {
                Some(error) => resolver.resolve(id, Err(error)),
                None => resolver.resolve(id, Ok(result.unwrap_or(Value::Null))),
            },
            Err(error) => {
                debug!(target: "server", peer_id = %peer_id, %error, "undecodable frame dropped");
            }
        }
    }

    let _ = room.peer_disconnected(peer_id.clone()).await;
    drop(bridge_socket);
    writer.abort();

    info!(target: "server", room_id = %room_id, peer_id = %peer_id, "connection closed");
}
