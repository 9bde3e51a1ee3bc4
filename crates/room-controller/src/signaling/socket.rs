//! Per-peer socket handles.
//!
//! A [`PeerSocket`] is the room-side handle to one peer's persistent
//! connection: fire-and-forget notifications plus a correlated
//! request/response helper with a bounded timeout and retry-on-timeout.
//! The transport side holds the matching [`SocketServerEnd`]: it drains
//! outbound frames onto the wire and resolves replies back into the
//! pending-request table.
//!
//! Notification sends never block and never fail visibly; a gone peer
//! simply stops receiving. Request timeouts are retried only on timeout,
//! never on an application-level error reply, and the last timeout is
//! surfaced as [`RoomError::Timeout`].

use crate::errors::RoomError;
use crate::signaling::protocol::Notification;
use common::types::PeerId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// A frame queued for delivery to the peer's connection.
#[derive(Debug)]
pub enum OutboundFrame {
    /// `{"method": ..., "data": ...}`
    Notification(Value),
    /// `{"request": true, "id": ..., "method": ..., "data": ...}`
    Request { id: u64, method: String, data: Value },
    /// `{"id": ..., "result": ...}` or `{"id": ..., "error": ...}`
    Reply {
        id: u64,
        result: Result<Value, Value>,
    },
    /// Close the underlying connection.
    Close,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, Value>>>>>;

/// Room-side handle to one peer connection.
#[derive(Clone)]
pub struct PeerSocket {
    peer_id: PeerId,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    pending: PendingMap,
    next_request_id: Arc<AtomicU64>,
    request_timeout: Duration,
    request_retries: u32,
}

impl PeerSocket {
    /// The peer this socket belongs to.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Send a notification. Best effort; a closed connection is ignored.
    pub fn notify(&self, notification: &Notification) {
        let frame = OutboundFrame::Notification(notification.to_wire());
        if self.outbound.send(frame).is_err() {
            debug!(
                target: "room.rpc",
                peer_id = %self.peer_id,
                "notification dropped, connection gone"
            );
        }
    }

    /// Queue a reply to a client request.
    pub fn reply(&self, id: u64, result: Result<Value, Value>) {
        let _ = self.outbound.send(OutboundFrame::Reply { id, result });
    }

    /// Ask the connection to close.
    pub fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Close);
    }

    /// Send a request and await its single correlated reply.
    ///
    /// Times out after the configured budget; timeouts are retried up to
    /// the configured count, then the last timeout is surfaced.
    /// Application-level error replies are returned immediately, without
    /// retrying.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, RoomError> {
        let mut attempts = 0;
        loop {
            match self.send_request_once(method, data.clone()).await {
                Err(RoomError::Timeout) if attempts < self.request_retries => {
                    attempts += 1;
                    warn!(
                        target: "room.rpc",
                        peer_id = %self.peer_id,
                        method,
                        attempt = attempts,
                        "request timed out, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    async fn send_request_once(&self, method: &str, data: Value) -> Result<Value, RoomError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| RoomError::internal("pending request table poisoned"))?;
            pending.insert(id, tx);
        }

        let frame = OutboundFrame::Request {
            id,
            method: method.to_string(),
            data,
        };
        if self.outbound.send(frame).is_err() {
            self.forget(id);
            return Err(RoomError::internal("connection gone"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(RoomError::internal(format!(
                "peer replied with error: {error}"
            ))),
            Ok(Err(_)) => Err(RoomError::internal("connection gone")),
            Err(_) => {
                self.forget(id);
                Err(RoomError::Timeout)
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

/// Resolves client replies to server-initiated requests.
#[derive(Clone)]
pub struct ReplyResolver {
    pending: PendingMap,
}

impl ReplyResolver {
    /// Resolve a client reply. Unknown or already-resolved ids are
    /// ignored (late replies after a timeout).
    pub fn resolve(&self, id: u64, result: Result<Value, Value>) {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

/// Transport-side end of a peer socket.
pub struct SocketServerEnd {
    /// Frames to put on the wire, in order.
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Resolver for replies to server-initiated requests.
    pub resolver: ReplyResolver,
}

impl SocketServerEnd {
    /// Resolve a client reply to a server-initiated request.
    pub fn resolve(&self, id: u64, result: Result<Value, Value>) {
        self.resolver.resolve(id, result);
    }
}

/// Create a connected socket pair for one peer.
#[must_use]
pub fn socket_pair(
    peer_id: PeerId,
    request_timeout: Duration,
    request_retries: u32,
) -> (PeerSocket, SocketServerEnd) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    let socket = PeerSocket {
        peer_id,
        outbound: outbound_tx,
        pending: Arc::clone(&pending),
        next_request_id: Arc::new(AtomicU64::new(1)),
        request_timeout,
        request_retries,
    };
    let server_end = SocketServerEnd {
        outbound: outbound_rx,
        resolver: ReplyResolver { pending },
    };

    (socket, server_end)
}
