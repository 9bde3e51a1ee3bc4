//! Config, registry, and peer fixtures.

use crate::test_socket::TestSocket;
use common::types::PeerId;
use media_engine::inprocess::InProcessEngine;
use room_controller::access::Role;
use room_controller::config::Config;
use room_controller::registry::{RegistryActor, RegistryHandle};
use room_controller::room::NewPeer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Build a config from key/value overrides over the defaults.
#[must_use]
pub fn test_config(overrides: &[(&str, &str)]) -> Arc<Config> {
    let vars: HashMap<String, String> = overrides
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect();
    Arc::new(Config::from_vars(&vars).expect("test config should be valid"))
}

/// Spawn a registry over the given engine.
pub fn spawn_registry(
    engine: &InProcessEngine,
    config: Arc<Config>,
) -> (RegistryHandle, CancellationToken) {
    let cancel_token = CancellationToken::new();
    let (handle, _task) = RegistryActor::spawn(
        config,
        Arc::new(engine.clone()),
        cancel_token.clone(),
    );
    (handle, cancel_token)
}

/// Build an arriving peer plus the transport side of its socket.
#[must_use]
pub fn new_peer(peer_id: &str, roles: Vec<Role>, token: Option<String>) -> (NewPeer, TestSocket) {
    let test_socket = TestSocket::new(peer_id);
    let peer = NewPeer {
        peer_id: PeerId::from(peer_id),
        display_name: format!("Peer {peer_id}"),
        picture: None,
        from: None,
        roles,
        token,
        socket: test_socket.handle(),
        client_ip: None,
    };
    (peer, test_socket)
}
