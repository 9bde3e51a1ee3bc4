//! The lobby: holding area for peers pending admission.
//!
//! Parked peers keep their socket and identity metadata so
//! permission-holders can render "who is waiting" and the peer can still
//! update its display name or picture. Entries are created on park and
//! destroyed on promotion or disconnect; the owning room reacts to the
//! returned peers, there are no ambient listeners here.

use crate::room::peer::Peer;
use common::types::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Wire projection of a parked peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPeerInfo {
    pub id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
}

/// Parked peers of one room, in arrival order.
#[derive(Default)]
pub struct Lobby {
    peers: HashMap<PeerId, Peer>,
    arrival_order: Vec<PeerId>,
}

impl Lobby {
    /// Park a peer. A peer id already parked is replaced in place
    /// (reconnect), keeping its arrival position.
    pub fn park(&mut self, peer: Peer) {
        let id = peer.id.clone();
        debug!(target: "room.lobby", peer_id = %id, "peer parked");
        if self.peers.insert(id.clone(), peer).is_some() {
            warn!(target: "room.lobby", peer_id = %id, "replaced an already-parked peer");
        } else {
            self.arrival_order.push(id);
        }
    }

    /// Take one parked peer out for promotion.
    pub fn promote(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let peer = self.peers.remove(peer_id)?;
        self.arrival_order.retain(|id| id != peer_id);
        Some(peer)
    }

    /// Take every parked peer out for promotion, in arrival order.
    pub fn promote_all(&mut self) -> Vec<Peer> {
        let order = std::mem::take(&mut self.arrival_order);
        order
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }

    /// Remove a parked peer that disconnected.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let peer = self.peers.remove(peer_id)?;
        self.arrival_order.retain(|id| id != peer_id);
        Some(peer)
    }

    /// Access to a parked peer.
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Mutable access to a parked peer (display metadata updates,
    /// role changes).
    pub fn peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// "Who is waiting", in arrival order.
    #[must_use]
    pub fn peer_list(&self) -> Vec<LobbyPeerInfo> {
        self.arrival_order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .map(|peer| LobbyPeerInfo {
                id: peer.id.clone(),
                display_name: peer.display_name.clone(),
                picture: peer.picture.clone(),
            })
            .collect()
    }

    /// Close the lobby, draining every parked peer for teardown.
    pub fn close(&mut self) -> Vec<Peer> {
        self.arrival_order.clear();
        self.peers.drain().map(|(_, peer)| peer).collect()
    }
}
