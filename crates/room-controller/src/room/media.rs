//! Media session orchestration for the room actor.
//!
//! Producer admission, consumer creation, cross-router piping, and the
//! handling of engine events relayed into the room mailbox. Consumer
//! creation is deliberately silent on preconditions that are expected
//! races (no receive capabilities, no receiving transport, incompatible
//! encoding): the peer simply does not get that consumer, and no error
//! reaches the producer.

use crate::access::policy::Permission;
use crate::errors::RoomError;
use crate::room::room::{MediaEvent, RoomActor, RoomMessage};
use crate::signaling::protocol::{ClientAppData, Notification};
use common::types::{ConsumerId, PeerId, ProducerId, RouterId};
use media_engine::{
    ConsumeOptions, ConsumerEvent, MediaKind, MediaSource, ProduceOptions, Producer,
    ProducerAppData, ProducerEvent, RtpParameters,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Relay priority requested for audio consumers.
const AUDIO_CONSUMER_PRIORITY: u8 = 255;

impl RoomActor {
    /// Handle the `produce` request: source permission gate, producer
    /// creation, piping, fan-out, and audio level registration.
    pub(super) async fn handle_produce(
        &mut self,
        peer_id: &PeerId,
        transport_id: common::types::TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: ClientAppData,
    ) -> Result<Value, RoomError> {
        let source = parse_source(app_data.source.as_deref())?;
        let permission = match source {
            MediaSource::Mic => Permission::ShareAudio,
            MediaSource::Webcam => Permission::ShareVideo,
            MediaSource::Screen => Permission::ShareScreen,
            MediaSource::ExtraVideo => Permission::ExtraVideo,
        };
        if !self.has_permission(peer_id, permission) {
            return Err(RoomError::Authorization);
        }
        self.require_joined(peer_id)?;

        let (transport, router_id) = {
            let peer = self
                .peers
                .get(peer_id)
                .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
            let transport = peer
                .transport(transport_id)
                .cloned()
                .ok_or_else(|| RoomError::NotFound(format!("transport {transport_id}")))?;
            (transport, peer.router_id())
        };

        let bundle = transport
            .produce(ProduceOptions {
                kind,
                rtp_parameters,
                app_data: ProducerAppData {
                    peer_id: peer_id.clone(),
                    source,
                },
            })
            .await
            .map_err(|err| {
                error!(
                    target: "room.media",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    %kind,
                    error = %err,
                    "producing failed"
                );
                RoomError::from(err)
            })?;
        let producer = bundle.producer;

        // Relay the new producer to every router already hosting
        // another peer of this room (idempotent per destination).
        if let Some(origin_router_id) = router_id {
            self.pipe_producer_to_peers_routers(origin_router_id, producer.id())
                .await?;
        }

        self.spawn_producer_relay(peer_id.clone(), producer.id(), bundle.events);

        {
            let peer = self
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
            peer.add_producer(Arc::clone(&producer));
        }

        // Fan the producer out as consumers to every other joined peer.
        for other_id in self.joined_peers_except(peer_id) {
            self.create_consumer(&other_id, peer_id, &producer).await;
        }

        if kind == MediaKind::Audio {
            self.register_audio_producer(peer_id, producer.id()).await;
        }

        Ok(json!({ "id": producer.id() }))
    }

    /// Handle the `closeProducer` request.
    pub(super) async fn handle_close_producer(
        &mut self,
        peer_id: &PeerId,
        producer_id: ProducerId,
    ) -> Result<Value, RoomError> {
        self.require_joined(peer_id)?;

        let (producer, router_id) = {
            let peer = self
                .peers
                .get(peer_id)
                .ok_or_else(|| RoomError::NotFound(format!("peer {peer_id}")))?;
            let producer = peer
                .producer(producer_id)
                .cloned()
                .ok_or_else(|| RoomError::NotFound(format!("producer {producer_id}")))?;
            (producer, peer.router_id())
        };

        if producer.kind() == MediaKind::Audio {
            if let Some(observer) = router_id.and_then(|id| self.audio_observers.get(&id)) {
                if let Err(error) = observer.remove_producer(producer_id).await {
                    error!(
                        target: "room.media",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        producer_id = %producer_id,
                        %error,
                        "removing producer from audio level observer failed"
                    );
                }
            }
        }

        producer.close();
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.remove_producer(producer_id);
        }

        Ok(Value::Null)
    }

    /// Create a consumer on `consumer_peer` for `producer` owned by
    /// `producer_peer`.
    ///
    /// Silently does nothing when the consuming peer has not declared
    /// receive capabilities, the producer's router reports the encoding
    /// as not consumable, or the peer has no receiving transport. The
    /// consumer is created paused for video so the client can ack before
    /// key frames flow; audio consumers get maximum relay priority.
    pub(super) async fn create_consumer(
        &mut self,
        consumer_peer_id: &PeerId,
        producer_peer_id: &PeerId,
        producer: &Arc<dyn Producer>,
    ) {
        let Some(consumer_peer) = self.peers.get(consumer_peer_id) else {
            return;
        };
        let Some(rtp_capabilities) = consumer_peer.rtp_capabilities.clone() else {
            return;
        };

        let Some(router) = self
            .peers
            .get(producer_peer_id)
            .and_then(|peer| peer.router_id())
            .and_then(|router_id| self.routers.get(&router_id))
        else {
            return;
        };
        if !router.can_consume(producer.id(), &rtp_capabilities) {
            return;
        }

        let Some(transport) = consumer_peer.consumer_transport().cloned() else {
            warn!(
                target: "room.media",
                room_id = %self.room_id,
                peer_id = %consumer_peer_id,
                "transport for consuming not found"
            );
            return;
        };

        let paused = producer.kind() == MediaKind::Video;
        let bundle = match transport
            .consume(ConsumeOptions {
                producer_id: producer.id(),
                rtp_capabilities,
                paused,
            })
            .await
        {
            Ok(bundle) => bundle,
            Err(error) => {
                warn!(
                    target: "room.media",
                    room_id = %self.room_id,
                    peer_id = %consumer_peer_id,
                    producer_id = %producer.id(),
                    %error,
                    "consumer creation failed"
                );
                return;
            }
        };
        let consumer = bundle.consumer;

        if producer.kind() == MediaKind::Audio {
            if let Err(error) = consumer.set_priority(AUDIO_CONSUMER_PRIORITY).await {
                warn!(
                    target: "room.media",
                    room_id = %self.room_id,
                    consumer_id = %consumer.id(),
                    %error,
                    "setting audio consumer priority failed"
                );
            }
        }

        self.spawn_consumer_relay(consumer_peer_id.clone(), consumer.id(), bundle.events);

        let Some(consumer_peer) = self.peers.get_mut(consumer_peer_id) else {
            consumer.close();
            return;
        };
        consumer_peer.add_consumer(Arc::clone(&consumer));

        consumer_peer.socket.notify(&Notification::NewConsumer {
            peer_id: producer_peer_id.clone(),
            kind: consumer.kind(),
            producer_id: producer.id(),
            id: consumer.id(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            app_data: producer.app_data(),
            producer_paused: consumer.producer_paused(),
            score: consumer.score(),
        });
    }

    /// Pipe every producer held by peers on other routers into
    /// `destination`, skipping producers already present there.
    pub(super) async fn pipe_producers_to_router(
        &self,
        destination_id: RouterId,
    ) -> Result<(), RoomError> {
        let destination = self
            .routers
            .get(&destination_id)
            .ok_or_else(|| RoomError::NotFound("router".to_string()))?;

        for peer in self.peers.values() {
            let Some(source_id) = peer.router_id() else {
                continue;
            };
            if source_id == destination_id {
                continue;
            }
            let Some(source) = self.routers.get(&source_id) else {
                continue;
            };

            for producer in peer.producers() {
                if destination.has_producer(producer.id()) {
                    continue;
                }
                source
                    .pipe_producer_to(producer.id(), destination.as_ref())
                    .await?;
            }
        }
        Ok(())
    }

    /// Pipe one producer from its origin router to every other router
    /// hosting a peer of this room.
    async fn pipe_producer_to_peers_routers(
        &mut self,
        origin_router_id: RouterId,
        producer_id: ProducerId,
    ) -> Result<(), RoomError> {
        let mut destinations: Vec<RouterId> = self
            .peers
            .values()
            .filter_map(|peer| peer.router_id())
            .filter(|router_id| *router_id != origin_router_id)
            .collect();
        destinations.sort_unstable_by_key(|router_id| router_id.0);
        destinations.dedup();

        let source = self
            .routers
            .get(&origin_router_id)
            .ok_or_else(|| RoomError::NotFound("router".to_string()))?;

        for destination_id in destinations {
            let Some(destination) = self.routers.get(&destination_id) else {
                continue;
            };
            if destination.has_producer(producer_id) {
                continue;
            }
            source
                .pipe_producer_to(producer_id, destination.as_ref())
                .await?;
            self.piped_routers.insert(destination_id);
        }
        Ok(())
    }

    async fn register_audio_producer(&self, peer_id: &PeerId, producer_id: ProducerId) {
        let observer = self
            .peers
            .get(peer_id)
            .and_then(|peer| peer.router_id())
            .and_then(|router_id| self.audio_observers.get(&router_id));
        let Some(observer) = observer else {
            return;
        };
        if let Err(error) = observer.add_producer(producer_id).await {
            error!(
                target: "room.media",
                room_id = %self.room_id,
                peer_id = %peer_id,
                producer_id = %producer_id,
                %error,
                "adding producer to audio level observer failed"
            );
        }
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    /// Fold a relayed engine event into room state.
    pub(super) fn handle_media_event(&mut self, event: MediaEvent) {
        if self.closed {
            return;
        }
        match event {
            MediaEvent::Consumer {
                peer_id,
                consumer_id,
                event,
            } => self.on_consumer_event(&peer_id, consumer_id, event),
            MediaEvent::Producer {
                peer_id,
                producer_id,
                event,
            } => self.on_producer_event(&peer_id, producer_id, event),
            MediaEvent::AudioLevel { router_id, event } => {
                self.on_audio_level(router_id, &event);
            }
        }
    }

    fn on_consumer_event(&mut self, peer_id: &PeerId, consumer_id: ConsumerId, event: ConsumerEvent) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let notification = match event {
            ConsumerEvent::Score(score) => Notification::ConsumerScore { consumer_id, score },
            ConsumerEvent::LayersChanged(layers) => Notification::ConsumerLayersChanged {
                consumer_id,
                spatial_layer: layers.map(|l| l.spatial_layer),
                temporal_layer: layers.and_then(|l| l.temporal_layer),
            },
            ConsumerEvent::ProducerPause => Notification::ConsumerPaused { consumer_id },
            ConsumerEvent::ProducerResume => Notification::ConsumerResumed { consumer_id },
            ConsumerEvent::ProducerClose | ConsumerEvent::TransportClose => {
                peer.remove_consumer(consumer_id);
                Notification::ConsumerClosed { consumer_id }
            }
        };
        peer.socket.notify(&notification);
    }

    fn on_producer_event(&mut self, peer_id: &PeerId, producer_id: ProducerId, event: ProducerEvent) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        match event {
            ProducerEvent::Score(score) => {
                peer.socket
                    .notify(&Notification::ProducerScore { producer_id, score });
            }
            ProducerEvent::TransportClose => {
                peer.remove_producer(producer_id);
            }
        }
    }

    fn on_audio_level(&mut self, router_id: RouterId, event: &media_engine::AudioLevelEvent) {
        let Some(state) = self.audio_levels.get_mut(&router_id) else {
            return;
        };
        match event {
            media_engine::AudioLevelEvent::Volumes(entries) => {
                if let Some(loudest) = entries.first() {
                    state.on_volumes(loudest.peer_id.clone(), loudest.volume);
                }
            }
            media_engine::AudioLevelEvent::Silence => state.on_silence(),
        }
        self.send_active_speaker_info();
    }

    /// Recompute the room-wide active speaker and broadcast when due.
    fn send_active_speaker_info(&mut self) {
        let update = self
            .speaker_tracker
            .evaluate(self.audio_levels.values(), Instant::now());
        let Some(update) = update else {
            return;
        };

        debug!(
            target: "room.media",
            room_id = %self.room_id,
            peer_id = ?update.peer_id,
            volume = update.volume,
            "active speaker changed"
        );

        let notification = Notification::ActiveSpeaker {
            peer_id: update.peer_id,
            volume: update.volume,
        };
        for peer in self.peers.values().filter(|peer| peer.joined) {
            peer.socket.notify(&notification);
        }
    }

    // ------------------------------------------------------------------
    // Event relays
    // ------------------------------------------------------------------

    pub(super) fn spawn_consumer_relay(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
        mut events: mpsc::UnboundedReceiver<ConsumerEvent>,
    ) {
        let sender = self.self_sender.clone();
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let last = event.is_close();
                        let message = RoomMessage::Media(MediaEvent::Consumer {
                            peer_id: peer_id.clone(),
                            consumer_id,
                            event,
                        });
                        if sender.send(message).await.is_err() || last {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub(super) fn spawn_producer_relay(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        mut events: mpsc::UnboundedReceiver<ProducerEvent>,
    ) {
        let sender = self.self_sender.clone();
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let last = matches!(event, ProducerEvent::TransportClose);
                        let message = RoomMessage::Media(MediaEvent::Producer {
                            peer_id: peer_id.clone(),
                            producer_id,
                            event,
                        });
                        if sender.send(message).await.is_err() || last {
                            break;
                        }
                    }
                }
            }
        });
    }
}

fn parse_source(source: Option<&str>) -> Result<MediaSource, RoomError> {
    let source = source.ok_or_else(|| RoomError::BadRequest("missing producer source".to_string()))?;
    serde_json::from_value(Value::String(source.to_string()))
        .map_err(|_| RoomError::BadRequest(format!("invalid producer source \"{source}\"")))
}
