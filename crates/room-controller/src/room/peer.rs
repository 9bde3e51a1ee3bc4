//! Peer state.
//!
//! A `Peer` is one participant's connection and resource ownership
//! boundary. Transports, producers, and consumers are exclusively owned
//! by their peer and released exactly once when the peer closes. The
//! router assignment is made once during the queued join and never
//! changes for the lifetime of the peer.

use crate::access::roles::{self, Role};
use crate::signaling::socket::PeerSocket;
use chrono::{DateTime, Utc};
use common::types::{ConsumerId, PeerId, ProducerId, RouterId, TransportId};
use media_engine::{Consumer, Producer, RtpCapabilities, Transport};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Wire projection of a peer, sent in `join` replies and `newPeer`
/// notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
    pub from: Option<String>,
    pub roles: Vec<u32>,
    pub raised_hand: bool,
    pub raised_hand_timestamp: Option<DateTime<Utc>>,
    pub local_recording_state: Option<String>,
}

/// One participant in a room.
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
    pub from: Option<String>,
    roles: Vec<Role>,
    pub joined: bool,
    router_id: Option<RouterId>,
    pub socket: PeerSocket,
    pub rtp_capabilities: Option<RtpCapabilities>,
    transports: HashMap<TransportId, Arc<dyn Transport>>,
    producers: HashMap<ProducerId, Arc<dyn Producer>>,
    consumers: HashMap<ConsumerId, Arc<dyn Consumer>>,
    pub raised_hand: bool,
    pub raised_hand_timestamp: Option<DateTime<Utc>>,
    pub local_recording_state: Option<String>,
}

impl Peer {
    /// Create a peer with its arrival roles. Every peer holds at least
    /// the baseline role.
    #[must_use]
    pub fn new(id: PeerId, display_name: String, socket: PeerSocket, mut arrival_roles: Vec<Role>) -> Self {
        if arrival_roles.is_empty() {
            arrival_roles.push(roles::NORMAL);
        }
        Self {
            id,
            display_name,
            picture: None,
            from: None,
            roles: arrival_roles,
            joined: false,
            router_id: None,
            socket,
            rtp_capabilities: None,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            raised_hand: false,
            raised_hand_timestamp: None,
            local_recording_state: None,
        }
    }

    /// The peer's held roles.
    #[must_use]
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Grant a role. Returns false if already held.
    pub fn add_role(&mut self, role: Role) -> bool {
        if self.roles.iter().any(|held| held.id == role.id) {
            return false;
        }
        self.roles.push(role);
        true
    }

    /// Revoke a role. Returns false if not held.
    pub fn remove_role(&mut self, role: Role) -> bool {
        let before = self.roles.len();
        self.roles.retain(|held| held.id != role.id);
        before != self.roles.len()
    }

    /// Replace the full role set (external identity update). An empty
    /// set falls back to the baseline role.
    pub fn set_roles(&mut self, mut new_roles: Vec<Role>) {
        if new_roles.is_empty() {
            new_roles.push(roles::NORMAL);
        }
        self.roles = new_roles;
    }

    /// Highest held role level.
    #[must_use]
    pub fn max_role_level(&self) -> u32 {
        roles::max_level(&self.roles)
    }

    /// The assigned router, if the queued join has run.
    #[must_use]
    pub fn router_id(&self) -> Option<RouterId> {
        self.router_id
    }

    /// Assign the router. The assignment is immutable once made; a
    /// second assignment is ignored.
    pub fn assign_router(&mut self, router_id: RouterId) {
        if let Some(existing) = self.router_id {
            warn!(
                target: "room.peer",
                peer_id = %self.id,
                router_id = %existing,
                "router already assigned, keeping existing"
            );
            return;
        }
        self.router_id = Some(router_id);
    }

    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.id(), transport);
    }

    #[must_use]
    pub fn transport(&self, id: TransportId) -> Option<&Arc<dyn Transport>> {
        self.transports.get(&id)
    }

    /// The transport the peer receives media on.
    #[must_use]
    pub fn consumer_transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transports.values().find(|t| t.consuming())
    }

    pub fn add_producer(&mut self, producer: Arc<dyn Producer>) {
        self.producers.insert(producer.id(), producer);
    }

    #[must_use]
    pub fn producer(&self, id: ProducerId) -> Option<&Arc<dyn Producer>> {
        self.producers.get(&id)
    }

    pub fn remove_producer(&mut self, id: ProducerId) -> Option<Arc<dyn Producer>> {
        self.producers.remove(&id)
    }

    /// Iterate the peer's producers.
    pub fn producers(&self) -> impl Iterator<Item = &Arc<dyn Producer>> {
        self.producers.values()
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.insert(consumer.id(), consumer);
    }

    #[must_use]
    pub fn consumer(&self, id: ConsumerId) -> Option<&Arc<dyn Consumer>> {
        self.consumers.get(&id)
    }

    pub fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.consumers.remove(&id)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Release every owned resource. Called exactly once, on peer close.
    pub fn release_resources(&mut self) {
        for (_, consumer) in self.consumers.drain() {
            consumer.close();
        }
        for (_, producer) in self.producers.drain() {
            producer.close();
        }
        for (_, transport) in self.transports.drain() {
            transport.close();
        }
    }

    /// Wire projection of this peer.
    #[must_use]
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            picture: self.picture.clone(),
            from: self.from.clone(),
            roles: self.roles.iter().map(|role| role.id.0).collect(),
            raised_hand: self.raised_hand,
            raised_hand_timestamp: self.raised_hand_timestamp,
            local_recording_state: self.local_recording_state.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::socket::socket_pair;
    use std::time::Duration;

    fn test_peer(id: &str) -> Peer {
        let (socket, _server_end) = socket_pair(PeerId::from(id), Duration::from_secs(20), 3);
        Peer::new(PeerId::from(id), "Test".to_string(), socket, vec![])
    }

    #[test]
    fn test_new_peer_holds_baseline_role() {
        let peer = test_peer("p1");
        assert_eq!(peer.roles(), &[roles::NORMAL]);
        assert!(!peer.joined);
    }

    #[test]
    fn test_add_and_remove_role() {
        let mut peer = test_peer("p1");

        assert!(peer.add_role(roles::MODERATOR));
        assert!(!peer.add_role(roles::MODERATOR));
        assert_eq!(peer.max_role_level(), roles::MODERATOR.level);

        assert!(peer.remove_role(roles::MODERATOR));
        assert!(!peer.remove_role(roles::MODERATOR));
        assert_eq!(peer.max_role_level(), roles::NORMAL.level);
    }

    #[test]
    fn test_router_assignment_is_immutable() {
        let mut peer = test_peer("p1");
        let first = RouterId::new();
        let second = RouterId::new();

        peer.assign_router(first);
        peer.assign_router(second);
        assert_eq!(peer.router_id(), Some(first));
    }

    #[test]
    fn test_peer_info_projection() {
        let mut peer = test_peer("p1");
        peer.add_role(roles::MODERATOR);
        peer.raised_hand = true;

        let info = peer.peer_info();
        assert_eq!(info.id, PeerId::from("p1"));
        assert_eq!(info.roles, vec![roles::NORMAL.id.0, roles::MODERATOR.id.0]);
        assert!(info.raised_hand);
    }

    #[test]
    fn test_set_roles_keeps_baseline_on_empty() {
        let mut peer = test_peer("p1");
        peer.set_roles(vec![]);
        assert_eq!(peer.roles(), &[roles::NORMAL]);
    }
}
