//! Admission and lobby integration tests: direct joins, parking,
//! promotion, capacity, and returning peers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::{PeerId, RoomId};
use room_controller::access::roles;
use room_controller::room::RoomHandle;
use room_controller::signaling::protocol::ClientRequest;
use room_test_utils::{new_peer, spawn_registry, test_config, InProcessEngine, TestSocket};
use serde_json::json;

fn join_request(caps: bool) -> ClientRequest {
    let data = if caps {
        json!({ "displayName": "Tester", "rtpCapabilities": { "codecs": [] } })
    } else {
        json!({ "displayName": "Tester" })
    };
    ClientRequest::parse("join", data).unwrap()
}

/// Admit a peer and complete its join protocol.
async fn admit_and_join(room: &RoomHandle, peer_id: &str, socket: &mut TestSocket) {
    let ready = socket.expect_notification().await;
    assert_eq!(ready["method"], "roomReady", "peer {peer_id} should be admitted");
    room.request(PeerId::from(peer_id), join_request(true))
        .await
        .unwrap();
}

#[tokio::test]
async fn unlocked_room_admits_directly_with_room_ready() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry
        .get_or_create(RoomId::from("alpha"))
        .await
        .unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();

    let ready = socket.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");

    let reply = room
        .request(PeerId::from("a"), join_request(true))
        .await
        .unwrap();
    assert_eq!(reply["locked"], false);
    assert_eq!(reply["peers"].as_array().unwrap().len(), 0);
    assert_eq!(reply["lastNHistory"][0], "a");
}

#[tokio::test]
async fn locked_room_parks_and_promotion_admits() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("beta")).await.unwrap();

    // A joins the unlocked room and locks it.
    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;
    room.request(
        PeerId::from("a"),
        ClientRequest::parse("lockRoom", json!({})).unwrap(),
    )
    .await
    .unwrap();

    // B arrives at the locked room and is parked; A is told.
    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();

    let parked = socket_a.expect_notification_method("parkedPeer").await;
    assert_eq!(parked["data"]["peerId"], "b");

    let status = room.status().await.unwrap();
    assert_eq!(status.lobby_count, 1);
    assert_eq!(status.peer_count, 1);

    // A promotes B: B goes through the join flow, A sees the lobby drain.
    room.request(
        PeerId::from("a"),
        ClientRequest::parse("promotePeer", json!({ "peerId": "b" })).unwrap(),
    )
    .await
    .unwrap();

    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    let promoted = socket_a
        .expect_notification_method("lobby:promotedPeer")
        .await;
    assert_eq!(promoted["data"]["peerId"], "b");

    let status = room.status().await.unwrap();
    assert_eq!(status.lobby_count, 0);
    assert_eq!(status.peer_count, 2);
}

#[tokio::test]
async fn lock_bypass_role_joins_locked_room_directly() {
    let engine = InProcessEngine::new(1);
    let config = test_config(&[("ROOM_ROOMS_UNLOCKED", "somewhere-else")]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry
        .get_or_create(RoomId::from("gamma"))
        .await
        .unwrap();
    assert!(room.status().await.unwrap().locked);

    let (admin, mut socket_admin) = new_peer("a", vec![roles::NORMAL, roles::ADMIN], None);
    room.handle_peer(admin).await.unwrap();
    let ready = socket_admin.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");

    let (normal, mut socket_normal) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(normal).await.unwrap();
    assert_eq!(room.status().await.unwrap().lobby_count, 1);
    assert!(socket_normal.drain_notification_methods().is_empty());
}

#[tokio::test]
async fn over_capacity_rejects_without_queueing() {
    let engine = InProcessEngine::new(1);
    let config = test_config(&[("ROOM_MAX_PEERS", "1")]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry
        .get_or_create(RoomId::from("delta"))
        .await
        .unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;

    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();

    let rejected = socket_b.expect_notification().await;
    assert_eq!(rejected["method"], "overRoomLimit");

    let status = room.status().await.unwrap();
    assert_eq!(status.peer_count, 1);
    assert_eq!(status.lobby_count, 0);
}

#[tokio::test]
async fn host_activation_parks_guests_until_host_joins() {
    let engine = InProcessEngine::new(1);
    let config = test_config(&[("ROOM_ACTIVATE_ON_HOST_JOIN", "true")]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry
        .get_or_create(RoomId::from("epsilon"))
        .await
        .unwrap();

    // A guest arriving at the empty room is parked and told to sign in.
    let (guest, mut socket_guest) = new_peer("guest", vec![roles::NORMAL], None);
    room.handle_peer(guest).await.unwrap();
    let notified = socket_guest.expect_notification().await;
    assert_eq!(notified["method"], "signInRequired");
    assert_eq!(room.status().await.unwrap().lobby_count, 1);

    // The host joins and the whole lobby is auto-promoted.
    let (host, mut socket_host) = new_peer("host", vec![roles::NORMAL, roles::ADMIN], None);
    room.handle_peer(host).await.unwrap();
    let ready = socket_host.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");

    let ready = socket_guest.expect_notification_method("roomReady").await;
    assert_eq!(ready["method"], "roomReady");
    let status = room.status().await.unwrap();
    assert_eq!(status.lobby_count, 0);
    assert_eq!(status.peer_count, 2);
}

#[tokio::test]
async fn returning_peer_with_token_gets_room_back() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("zeta")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    admit_and_join(&room, "a", &mut socket).await;

    let token = room.token(PeerId::from("a")).await.unwrap().unwrap();

    // Drop the connection, then return with the minted token. The
    // returning branch wins even though the room is now locked.
    room.request(
        PeerId::from("a"),
        ClientRequest::parse("lockRoom", json!({})).unwrap(),
    )
    .await
    .unwrap();
    room.peer_disconnected(PeerId::from("a")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], Some(token));
    room.handle_peer(peer).await.unwrap();

    let back = socket.expect_notification().await;
    assert_eq!(back["method"], "roomBack");
    assert_eq!(room.status().await.unwrap().peer_count, 1);
}

#[tokio::test]
async fn forged_token_does_not_authenticate_returning_peer() {
    let engine = InProcessEngine::new(1);
    let config = test_config(&[("ROOM_ROOMS_UNLOCKED", "somewhere-else")]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry.get_or_create(RoomId::from("eta")).await.unwrap();

    let forged = "0f".repeat(32);
    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], Some(forged));
    room.handle_peer(peer).await.unwrap();

    // Not returning, room locked: parked, nothing delivered.
    assert_eq!(room.status().await.unwrap().lobby_count, 1);
    assert!(socket.drain_notification_methods().is_empty());
}

#[tokio::test]
async fn duplicate_join_request_is_rejected() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry
        .get_or_create(RoomId::from("theta"))
        .await
        .unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    admit_and_join(&room, "a", &mut socket).await;

    let err = room
        .request(PeerId::from("a"), join_request(false))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "peer already joined");
}

#[tokio::test]
async fn joins_preserve_arrival_order_in_last_n() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("iota")).await.unwrap();

    let mut sockets = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let (peer, socket) = new_peer(name, vec![roles::NORMAL], None);
        room.handle_peer(peer).await.unwrap();
        sockets.push(socket);
    }
    for socket in &mut sockets {
        let ready = socket.expect_notification().await;
        assert_eq!(ready["method"], "roomReady");
    }

    let reply = room
        .request(PeerId::from("d"), join_request(false))
        .await
        .unwrap();
    assert_eq!(reply["lastNHistory"], json!(["a", "b", "c", "d"]));
}

#[tokio::test]
async fn role_change_promotes_parked_peer_with_lock_bypass() {
    let engine = InProcessEngine::new(1);
    let config = test_config(&[("ROOM_ROOMS_UNLOCKED", "somewhere-else")]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry.get_or_create(RoomId::from("kappa")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    assert_eq!(room.status().await.unwrap().lobby_count, 1);

    // The signaling edge re-authenticates the peer with a role that
    // bypasses the room lock; the parked peer is promoted right away.
    room.peer_roles_updated(
        PeerId::from("a"),
        vec![roles::NORMAL, roles::ADMIN],
    )
    .await
    .unwrap();

    let ready = socket.expect_notification_method("roomReady").await;
    assert_eq!(ready["method"], "roomReady");
    let status = room.status().await.unwrap();
    assert_eq!(status.lobby_count, 0);
    assert_eq!(status.peer_count, 1);
}

#[tokio::test]
async fn unknown_method_fails_with_distinguished_error() {
    let err = ClientRequest::parse("blastOff", json!({})).unwrap_err();
    assert_eq!(err.to_string(), "unknown request method \"blastOff\"");
    assert_eq!(err.error_code(), 5);
}
