//! Media orchestration integration tests: producer admission, consumer
//! backfill and its silent no-op contract, fan-out, and active speaker
//! tracking.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::{PeerId, RoomId, WorkerId};
use media_engine::{MediaEngine, VolumeEntry};
use room_controller::access::roles;
use room_controller::room::RoomHandle;
use room_controller::signaling::protocol::ClientRequest;
use room_test_utils::{new_peer, spawn_registry, test_config, InProcessEngine, TestSocket};
use serde_json::{json, Value};
use uuid::Uuid;

async fn admit_and_join(room: &RoomHandle, peer_id: &str, socket: &mut TestSocket) {
    let ready = socket.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    room.request(
        PeerId::from(peer_id),
        ClientRequest::parse(
            "join",
            json!({ "displayName": peer_id, "rtpCapabilities": { "codecs": [] } }),
        )
        .unwrap(),
    )
    .await
    .unwrap();
}

/// Create a transport for the peer and return its id.
async fn create_transport(room: &RoomHandle, peer_id: &str, producing: bool) -> String {
    let reply = room
        .request(
            PeerId::from(peer_id),
            ClientRequest::parse(
                "createWebRtcTransport",
                json!({ "producing": producing, "consuming": !producing }),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    reply["id"].as_str().unwrap().to_string()
}

async fn produce(
    room: &RoomHandle,
    peer_id: &str,
    transport_id: &str,
    source: &str,
) -> Result<Value, room_controller::errors::RoomError> {
    let kind = if source == "mic" { "audio" } else { "video" };
    room.request(
        PeerId::from(peer_id),
        ClientRequest::parse(
            "produce",
            json!({
                "transportId": transport_id,
                "kind": kind,
                "rtpParameters": { "codecs": [] },
                "appData": { "source": source }
            }),
        )
        .unwrap(),
    )
    .await
}

#[tokio::test]
async fn producer_without_source_permission_is_rejected() {
    let engine = InProcessEngine::new(1);
    let config = test_config(&[(
        "ROOM_POLICY_OVERRIDES",
        r#"{"permissions": {"shareAudio": []}}"#,
    )]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry.get_or_create(RoomId::from("alpha")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    admit_and_join(&room, "a", &mut socket).await;

    let transport_id = create_transport(&room, "a", true).await;
    let err = produce(&room, "a", &transport_id, "mic").await.unwrap_err();

    assert_eq!(err.error_code(), 3);
    // No producer was registered for the peer.
    assert_eq!(engine.produced_count(), 0);
}

#[tokio::test]
async fn unknown_producer_source_is_rejected() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("beta")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    admit_and_join(&room, "a", &mut socket).await;

    let transport_id = create_transport(&room, "a", true).await;
    let err = produce(&room, "a", &transport_id, "hologram")
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), 5);
    assert_eq!(engine.produced_count(), 0);
}

#[tokio::test]
async fn new_producer_fans_out_to_receiving_peers() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("gamma")).await.unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;

    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();
    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    // B prepares its receiving transport before joining.
    create_transport(&room, "b", false).await;
    room.request(
        PeerId::from("b"),
        ClientRequest::parse(
            "join",
            json!({ "displayName": "b", "rtpCapabilities": { "codecs": [] } }),
        )
        .unwrap(),
    )
    .await
    .unwrap();

    let transport_id = create_transport(&room, "a", true).await;
    let reply = produce(&room, "a", &transport_id, "mic").await.unwrap();
    assert!(reply["id"].is_string());

    let new_consumer = socket_b.expect_notification_method("newConsumer").await;
    assert_eq!(new_consumer["data"]["peerId"], "a");
    assert_eq!(new_consumer["data"]["kind"], "audio");
    assert_eq!(new_consumer["data"]["appData"]["source"], "mic");
    assert_eq!(engine.consumed_count(), 1);

    // The audio producer is observed for active speaker tracking.
    let router_id = engine.worker_routers(WorkerId(1))[0];
    assert_eq!(engine.observed_producers(router_id), 1);
}

#[tokio::test]
async fn join_backfills_consumers_for_existing_producers() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("delta")).await.unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;
    let transport_id = create_transport(&room, "a", true).await;
    produce(&room, "a", &transport_id, "webcam").await.unwrap();

    // B joins afterwards with a receiving transport and capabilities.
    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();
    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    create_transport(&room, "b", false).await;
    let reply = room
        .request(
            PeerId::from("b"),
            ClientRequest::parse(
                "join",
                json!({ "displayName": "b", "rtpCapabilities": { "codecs": [] } }),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(reply["peers"].as_array().unwrap().len(), 1);

    let new_consumer = socket_b.expect_notification_method("newConsumer").await;
    assert_eq!(new_consumer["data"]["peerId"], "a");
    // Video consumers are created paused for the client ack.
    assert_eq!(engine.consumed_count(), 1);

    // A learns about B after B's reply was sent.
    let announced = socket_a.expect_notification_method("newPeer").await;
    assert_eq!(announced["data"]["id"], "b");
}

#[tokio::test]
async fn consumer_creation_is_a_no_op_without_receive_capabilities() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("epsilon")).await.unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;
    let transport_id = create_transport(&room, "a", true).await;
    produce(&room, "a", &transport_id, "mic").await.unwrap();

    // B joins without declaring receive capabilities.
    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();
    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    create_transport(&room, "b", false).await;
    room.request(
        PeerId::from("b"),
        ClientRequest::parse("join", json!({ "displayName": "b" })).unwrap(),
    )
    .await
    .unwrap();

    // No consumer was registered, no error was surfaced.
    assert_eq!(engine.consumed_count(), 0);
    assert!(!socket_b
        .drain_notification_methods()
        .contains(&"newConsumer".to_string()));
}

#[tokio::test]
async fn consumer_creation_is_a_no_op_when_encoding_not_consumable() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("zeta")).await.unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;
    let transport_a = create_transport(&room, "a", true).await;

    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();
    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    create_transport(&room, "b", false).await;
    room.request(
        PeerId::from("b"),
        ClientRequest::parse(
            "join",
            json!({ "displayName": "b", "rtpCapabilities": { "codecs": [] } }),
        )
        .unwrap(),
    )
    .await
    .unwrap();

    engine.set_consumable(false);
    produce(&room, "a", &transport_a, "mic").await.unwrap();

    assert_eq!(engine.produced_count(), 1);
    assert_eq!(engine.consumed_count(), 0);
}

#[tokio::test]
async fn close_producer_releases_and_deregisters_from_observer() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("eta")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    admit_and_join(&room, "a", &mut socket).await;

    let transport_id = create_transport(&room, "a", true).await;
    let reply = produce(&room, "a", &transport_id, "mic").await.unwrap();
    let producer_id = reply["id"].as_str().unwrap().to_string();

    let router_id = engine.worker_routers(WorkerId(1))[0];
    assert_eq!(engine.observed_producers(router_id), 1);

    room.request(
        PeerId::from("a"),
        ClientRequest::parse("closeProducer", json!({ "producerId": producer_id })).unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(engine.observed_producers(router_id), 0);

    // Closing it again is a benign not-found.
    let err = room
        .request(
            PeerId::from("a"),
            ClientRequest::parse("closeProducer", json!({ "producerId": producer_id })).unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), 4);
}

#[tokio::test]
async fn missing_consumer_is_reported_as_engine_not_found() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("theta")).await.unwrap();

    let (peer, mut socket) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer).await.unwrap();
    admit_and_join(&room, "a", &mut socket).await;

    let err = room
        .request(
            PeerId::from("a"),
            ClientRequest::parse(
                "pauseConsumer",
                json!({ "consumerId": Uuid::new_v4().to_string() }),
            )
            .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(err.is_not_found_in_engine());
}

#[tokio::test]
async fn scale_out_assigns_new_router_and_pipes_existing_producers() {
    let engine = InProcessEngine::new(2);
    // A worker saturates after one peer, forcing the next join onto the
    // second worker's router.
    let config = test_config(&[("ROOM_ROUTER_SCALE_SIZE", "1")]);
    let (registry, _cancel) = spawn_registry(&engine, config);
    let room = registry.get_or_create(RoomId::from("kappa")).await.unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;
    let transport_id = create_transport(&room, "a", true).await;
    let reply = produce(&room, "a", &transport_id, "mic").await.unwrap();
    let producer_id = common::types::ProducerId(reply["id"].as_str().unwrap().parse().unwrap());

    let router_a = engine.worker_routers(WorkerId(1))[0];
    assert!(engine.router_has_producer(router_a, producer_id));
    let router_b = engine.worker_routers(WorkerId(2))[0];
    assert!(!engine.router_has_producer(router_b, producer_id));

    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();
    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");

    // B landed on the second worker's router, and A's producer was
    // piped over so consumers there can reach it.
    assert!(engine.router_has_producer(router_b, producer_id));
    let piped_after_join = engine.piped_count();
    assert_eq!(piped_after_join, 1);

    // Piping is idempotent: assigning more peers to the same router
    // does not re-pipe producers already present on it.
    let (peer_c, mut socket_c) = new_peer("c", vec![roles::NORMAL], None);
    room.handle_peer(peer_c).await.unwrap();
    let ready = socket_c.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    assert_eq!(engine.piped_count(), piped_after_join);
}

#[tokio::test]
async fn active_speaker_is_broadcast_on_change_only() {
    let engine = InProcessEngine::new(1);
    let (registry, _cancel) = spawn_registry(&engine, test_config(&[]));
    let room = registry.get_or_create(RoomId::from("iota")).await.unwrap();

    let (peer_a, mut socket_a) = new_peer("a", vec![roles::NORMAL], None);
    room.handle_peer(peer_a).await.unwrap();
    admit_and_join(&room, "a", &mut socket_a).await;
    let (peer_b, mut socket_b) = new_peer("b", vec![roles::NORMAL], None);
    room.handle_peer(peer_b).await.unwrap();
    let ready = socket_b.expect_notification().await;
    assert_eq!(ready["method"], "roomReady");
    room.request(
        PeerId::from("b"),
        ClientRequest::parse("join", json!({ "displayName": "b" })).unwrap(),
    )
    .await
    .unwrap();

    let transport_id = create_transport(&room, "a", true).await;
    let reply = produce(&room, "a", &transport_id, "mic").await.unwrap();
    let producer_id = reply["id"].as_str().unwrap().parse().unwrap();
    let router_id = engine.worker_routers(WorkerId(1))[0];

    engine.emit_volumes(
        router_id,
        vec![VolumeEntry {
            producer_id: common::types::ProducerId(producer_id),
            peer_id: PeerId::from("a"),
            volume: -30,
        }],
    );

    let speaker = socket_b.expect_notification_method("activeSpeaker").await;
    assert_eq!(speaker["data"]["peerId"], "a");
    assert_eq!(speaker["data"]["volume"], -30);

    // A jittery repeat of the same speaker within the debounce window
    // is suppressed.
    engine.emit_volumes(
        router_id,
        vec![VolumeEntry {
            producer_id: common::types::ProducerId(producer_id),
            peer_id: PeerId::from("a"),
            volume: -28,
        }],
    );
    // Silence flips the active speaker to null immediately.
    engine.emit_silence(router_id);

    let speaker = socket_b.expect_notification_method("activeSpeaker").await;
    assert_eq!(speaker["data"]["peerId"], Value::Null);
}
