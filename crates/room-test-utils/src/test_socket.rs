//! Scriptable peer-socket harness.
//!
//! Wraps the transport side of a peer socket: tests read the frames a
//! room pushed to the peer and script replies to server-initiated
//! requests.

use common::types::PeerId;
use room_controller::signaling::socket::{
    socket_pair, OutboundFrame, PeerSocket, ReplyResolver,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// The transport side of one test peer's socket.
pub struct TestSocket {
    pub peer_id: PeerId,
    socket: PeerSocket,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    resolver: ReplyResolver,
}

impl TestSocket {
    /// Create a socket pair with default RPC settings.
    #[must_use]
    pub fn new(peer_id: &str) -> Self {
        Self::with_rpc(peer_id, Duration::from_secs(20), 3)
    }

    /// Create a socket pair with explicit RPC timeout and retries.
    #[must_use]
    pub fn with_rpc(peer_id: &str, request_timeout: Duration, request_retries: u32) -> Self {
        let peer_id = PeerId::from(peer_id);
        let (socket, server_end) = socket_pair(peer_id.clone(), request_timeout, request_retries);
        Self {
            peer_id,
            socket,
            outbound: server_end.outbound,
            resolver: server_end.resolver,
        }
    }

    /// The room-side handle, to hand to a room or call directly.
    #[must_use]
    pub fn handle(&self) -> PeerSocket {
        self.socket.clone()
    }

    /// Await the next outbound frame.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Await the next frame and require it to be a notification.
    pub async fn expect_notification(&mut self) -> Value {
        match self.next_frame().await {
            Some(OutboundFrame::Notification(wire)) => wire,
            other => panic!("expected notification, got {other:?}"),
        }
    }

    /// Await a notification with the given method, skipping others.
    pub async fn expect_notification_method(&mut self, method: &str) -> Value {
        loop {
            let wire = match self.next_frame().await {
                Some(OutboundFrame::Notification(wire)) => wire,
                Some(_) => continue,
                None => panic!("socket closed while waiting for \"{method}\""),
            };
            if wire["method"] == method {
                return wire;
            }
        }
    }

    /// Await the next frame and require it to be a server request.
    pub async fn expect_request(&mut self) -> (u64, String, Value) {
        match self.next_frame().await {
            Some(OutboundFrame::Request { id, method, data }) => (id, method, data),
            other => panic!("expected request, got {other:?}"),
        }
    }

    /// Drain every immediately available notification method name.
    pub fn drain_notification_methods(&mut self) -> Vec<String> {
        let mut methods = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            if let OutboundFrame::Notification(wire) = frame {
                if let Some(method) = wire["method"].as_str() {
                    methods.push(method.to_string());
                }
            }
        }
        methods
    }

    /// Whether a close frame is pending (connection teardown requested).
    pub fn saw_close(&mut self) -> bool {
        while let Ok(frame) = self.outbound.try_recv() {
            if matches!(frame, OutboundFrame::Close) {
                return true;
            }
        }
        false
    }

    /// Script a reply to a server-initiated request.
    pub fn reply(&self, id: u64, result: Result<Value, Value>) {
        self.resolver.resolve(id, result);
    }
}
