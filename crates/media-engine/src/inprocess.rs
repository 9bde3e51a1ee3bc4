//! In-process engine.
//!
//! A bookkeeping implementation of the engine contract: it tracks
//! workers, routers, transports, producers, consumers, piping, and
//! audio level observers without moving any actual media. The service
//! binary runs against it until a real SFU binding is wired in, and
//! test harnesses drive failure paths and audio level reports through
//! its simulation switches.

use crate::engine::{
    AudioLevelObserver, AudioLevelObserverBundle, Consumer, ConsumerBundle, MediaEngine, Producer,
    ProducerBundle, Router, Transport,
};
use crate::error::EngineError;
use crate::events::{AudioLevelEvent, ConsumerEvent, ProducerEvent, VolumeEntry};
use crate::types::{
    AudioLevelObserverConfig, ConsumeOptions, ConsumerLayers, DtlsParameters, IceParameters,
    MediaKind, ProduceOptions, ProducerAppData, RouterCodecConfig, RtpCapabilities, RtpParameters,
    TransportOptions,
};
use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct ProducerRecord {
    kind: Option<MediaKind>,
    app_data: Option<ProducerAppData>,
    paused: bool,
    events: Option<mpsc::UnboundedSender<ProducerEvent>>,
}

struct ConsumerRecord {
    producer_id: ProducerId,
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

#[derive(Default)]
struct EngineState {
    workers: Vec<WorkerId>,
    worker_routers: Mutex<HashMap<WorkerId, Vec<RouterId>>>,
    /// Producers present on each router (origin or piped in).
    router_producers: Mutex<HashMap<RouterId, HashSet<ProducerId>>>,
    producers: Mutex<HashMap<ProducerId, ProducerRecord>>,
    consumers: Mutex<HashMap<ConsumerId, ConsumerRecord>>,
    audio_observers: Mutex<HashMap<RouterId, mpsc::UnboundedSender<AudioLevelEvent>>>,
    observed_producers: Mutex<HashMap<RouterId, HashSet<ProducerId>>>,

    // Simulation switches and counters.
    consumable: AtomicBool,
    fail_produce: AtomicBool,
    produced: AtomicUsize,
    consumed: AtomicUsize,
    piped: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The in-process media engine.
#[derive(Clone)]
pub struct InProcessEngine {
    state: Arc<EngineState>,
}

impl InProcessEngine {
    /// Create an engine with `worker_count` simulated workers.
    #[must_use]
    pub fn new(worker_count: u32) -> Self {
        let state = EngineState {
            workers: (1..=worker_count).map(WorkerId).collect(),
            consumable: AtomicBool::new(true),
            ..EngineState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Simulation switch: report every producer as (not) consumable.
    pub fn set_consumable(&self, consumable: bool) {
        self.state.consumable.store(consumable, Ordering::Relaxed);
    }

    /// Simulation switch: fail producer creation.
    pub fn set_fail_produce(&self, fail: bool) {
        self.state.fail_produce.store(fail, Ordering::Relaxed);
    }

    /// Simulation hook: deliver a volumes report on a router's observer.
    pub fn emit_volumes(&self, router_id: RouterId, entries: Vec<VolumeEntry>) {
        if let Some(sender) = lock(&self.state.audio_observers).get(&router_id) {
            let _ = sender.send(AudioLevelEvent::Volumes(entries));
        }
    }

    /// Simulation hook: deliver a silence report on a router's observer.
    pub fn emit_silence(&self, router_id: RouterId) {
        if let Some(sender) = lock(&self.state.audio_observers).get(&router_id) {
            let _ = sender.send(AudioLevelEvent::Silence);
        }
    }

    /// Producers created so far.
    #[must_use]
    pub fn produced_count(&self) -> usize {
        self.state.produced.load(Ordering::Relaxed)
    }

    /// Consumers created so far.
    #[must_use]
    pub fn consumed_count(&self) -> usize {
        self.state.consumed.load(Ordering::Relaxed)
    }

    /// Pipe operations performed so far.
    #[must_use]
    pub fn piped_count(&self) -> usize {
        self.state.piped.load(Ordering::Relaxed)
    }

    /// Producers currently observed on a router's audio level observer.
    #[must_use]
    pub fn observed_producers(&self, router_id: RouterId) -> usize {
        lock(&self.state.observed_producers)
            .get(&router_id)
            .map_or(0, HashSet::len)
    }

    /// Whether a producer's media is present on a router.
    #[must_use]
    pub fn router_has_producer(&self, router_id: RouterId, producer_id: ProducerId) -> bool {
        lock(&self.state.router_producers)
            .get(&router_id)
            .is_some_and(|present| present.contains(&producer_id))
    }
}

#[async_trait]
impl MediaEngine for InProcessEngine {
    fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.workers.clone()
    }

    fn worker_routers(&self, worker_id: WorkerId) -> Vec<RouterId> {
        lock(&self.state.worker_routers)
            .get(&worker_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn create_router(
        &self,
        worker_id: WorkerId,
        _codecs: &RouterCodecConfig,
    ) -> Result<Arc<dyn Router>, EngineError> {
        if !self.state.workers.contains(&worker_id) {
            return Err(EngineError::NotFound(format!("worker {worker_id}")));
        }
        let router_id = RouterId::new();
        lock(&self.state.worker_routers)
            .entry(worker_id)
            .or_default()
            .push(router_id);
        lock(&self.state.router_producers).insert(router_id, HashSet::new());

        Ok(Arc::new(InProcessRouter {
            id: router_id,
            worker_id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InProcessRouter {
    id: RouterId,
    worker_id: WorkerId,
    state: Arc<EngineState>,
    closed: AtomicBool,
}

#[async_trait]
impl Router for InProcessRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities(json!({ "codecs": [], "headerExtensions": [] }))
    }

    fn can_consume(&self, producer_id: ProducerId, _capabilities: &RtpCapabilities) -> bool {
        self.state.consumable.load(Ordering::Relaxed)
            && lock(&self.state.producers).contains_key(&producer_id)
    }

    fn has_producer(&self, producer_id: ProducerId) -> bool {
        lock(&self.state.router_producers)
            .get(&self.id)
            .is_some_and(|present| present.contains(&producer_id))
    }

    async fn pipe_producer_to(
        &self,
        producer_id: ProducerId,
        destination: &dyn Router,
    ) -> Result<(), EngineError> {
        if !lock(&self.state.producers).contains_key(&producer_id) {
            return Err(EngineError::NotFound(format!("producer {producer_id}")));
        }
        lock(&self.state.router_producers)
            .entry(destination.id())
            .or_default()
            .insert(producer_id);
        self.state.piped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Closed);
        }
        Ok(Arc::new(InProcessTransport {
            id: TransportId::new(),
            router_id: self.id,
            options,
            state: Arc::clone(&self.state),
            owned_producers: Mutex::new(Vec::new()),
            owned_consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_audio_level_observer(
        &self,
        _config: AudioLevelObserverConfig,
    ) -> Result<AudioLevelObserverBundle, EngineError> {
        let (sender, events) = mpsc::unbounded_channel();
        lock(&self.state.audio_observers).insert(self.id, sender);
        lock(&self.state.observed_producers).insert(self.id, HashSet::new());

        Ok(AudioLevelObserverBundle {
            observer: Arc::new(InProcessAudioLevelObserver {
                router_id: self.id,
                state: Arc::clone(&self.state),
            }),
            events,
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        lock(&self.state.router_producers).remove(&self.id);
        if let Some(routers) = lock(&self.state.worker_routers).get_mut(&self.worker_id) {
            routers.retain(|id| *id != self.id);
        }
    }
}

struct InProcessAudioLevelObserver {
    router_id: RouterId,
    state: Arc<EngineState>,
}

#[async_trait]
impl AudioLevelObserver for InProcessAudioLevelObserver {
    async fn add_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        if !lock(&self.state.producers).contains_key(&producer_id) {
            return Err(EngineError::NotFound(format!("producer {producer_id}")));
        }
        lock(&self.state.observed_producers)
            .entry(self.router_id)
            .or_default()
            .insert(producer_id);
        Ok(())
    }

    async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        lock(&self.state.observed_producers)
            .entry(self.router_id)
            .or_default()
            .remove(&producer_id);
        Ok(())
    }

    fn close(&self) {
        lock(&self.state.audio_observers).remove(&self.router_id);
        lock(&self.state.observed_producers).remove(&self.router_id);
    }
}

struct InProcessTransport {
    id: TransportId,
    router_id: RouterId,
    options: TransportOptions,
    state: Arc<EngineState>,
    owned_producers: Mutex<Vec<ProducerId>>,
    owned_consumers: Mutex<Vec<ConsumerId>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for InProcessTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn producing(&self) -> bool {
        self.options.producing
    }

    fn consuming(&self) -> bool {
        self.options.consuming
    }

    fn ice_parameters(&self) -> IceParameters {
        IceParameters(json!({ "usernameFragment": self.id.to_string(), "iceLite": true }))
    }

    fn ice_candidates(&self) -> serde_json::Value {
        json!([])
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters(json!({ "role": "auto", "fingerprints": [] }))
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<IceParameters, EngineError> {
        Ok(self.ice_parameters())
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<(), EngineError> {
        Ok(())
    }

    async fn produce(&self, options: ProduceOptions) -> Result<ProducerBundle, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Closed);
        }
        if self.state.fail_produce.load(Ordering::Relaxed) {
            return Err(EngineError::Operation("produce disabled".to_string()));
        }

        let producer_id = ProducerId::new();
        let (sender, events) = mpsc::unbounded_channel();
        lock(&self.state.producers).insert(
            producer_id,
            ProducerRecord {
                kind: Some(options.kind),
                app_data: Some(options.app_data.clone()),
                paused: false,
                events: Some(sender),
            },
        );
        lock(&self.state.router_producers)
            .entry(self.router_id)
            .or_default()
            .insert(producer_id);
        lock(&self.owned_producers).push(producer_id);
        self.state.produced.fetch_add(1, Ordering::Relaxed);

        Ok(ProducerBundle {
            producer: Arc::new(InProcessProducer {
                id: producer_id,
                kind: options.kind,
                app_data: options.app_data,
                state: Arc::clone(&self.state),
            }),
            events,
        })
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<ConsumerBundle, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Closed);
        }
        let (kind, producer_paused) = {
            let producers = lock(&self.state.producers);
            let record = producers
                .get(&options.producer_id)
                .ok_or_else(|| EngineError::NotFound(format!("producer {}", options.producer_id)))?;
            (record.kind.unwrap_or(MediaKind::Audio), record.paused)
        };

        let consumer_id = ConsumerId::new();
        let (sender, events) = mpsc::unbounded_channel();
        lock(&self.state.consumers).insert(
            consumer_id,
            ConsumerRecord {
                producer_id: options.producer_id,
                events: sender,
            },
        );
        lock(&self.owned_consumers).push(consumer_id);
        self.state.consumed.fetch_add(1, Ordering::Relaxed);

        Ok(ConsumerBundle {
            consumer: Arc::new(InProcessConsumer {
                id: consumer_id,
                producer_id: options.producer_id,
                kind,
                paused: AtomicBool::new(options.paused),
                producer_paused: AtomicBool::new(producer_paused),
                state: Arc::clone(&self.state),
            }),
            events,
        })
    }

    async fn stats(&self) -> Result<serde_json::Value, EngineError> {
        Ok(json!([{ "type": "transport", "transportId": self.id.to_string() }]))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        for producer_id in lock(&self.owned_producers).drain(..) {
            if let Some(record) = lock(&self.state.producers).remove(&producer_id) {
                if let Some(events) = record.events {
                    let _ = events.send(ProducerEvent::TransportClose);
                }
                notify_consumers_of(&self.state, producer_id, &ConsumerEvent::ProducerClose);
            }
        }
        for consumer_id in lock(&self.owned_consumers).drain(..) {
            if let Some(record) = lock(&self.state.consumers).remove(&consumer_id) {
                let _ = record.events.send(ConsumerEvent::TransportClose);
            }
        }
    }
}

fn notify_consumers_of(state: &EngineState, producer_id: ProducerId, event: &ConsumerEvent) {
    let consumers = lock(&state.consumers);
    for record in consumers.values() {
        if record.producer_id == producer_id {
            let _ = record.events.send(event.clone());
        }
    }
}

struct InProcessProducer {
    id: ProducerId,
    kind: MediaKind,
    app_data: ProducerAppData,
    state: Arc<EngineState>,
}

#[async_trait]
impl Producer for InProcessProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn app_data(&self) -> ProducerAppData {
        self.app_data.clone()
    }

    fn paused(&self) -> bool {
        lock(&self.state.producers)
            .get(&self.id)
            .is_some_and(|record| record.paused)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        let mut producers = lock(&self.state.producers);
        let record = producers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {}", self.id)))?;
        record.paused = true;
        drop(producers);
        notify_consumers_of(&self.state, self.id, &ConsumerEvent::ProducerPause);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let mut producers = lock(&self.state.producers);
        let record = producers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {}", self.id)))?;
        record.paused = false;
        drop(producers);
        notify_consumers_of(&self.state, self.id, &ConsumerEvent::ProducerResume);
        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value, EngineError> {
        Ok(json!([{ "type": "producer", "producerId": self.id.to_string() }]))
    }

    fn close(&self) {
        let removed = lock(&self.state.producers).remove(&self.id);
        if removed.is_none() {
            return;
        }
        for present in lock(&self.state.router_producers).values_mut() {
            present.remove(&self.id);
        }
        notify_consumers_of(&self.state, self.id, &ConsumerEvent::ProducerClose);
    }
}

struct InProcessConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    state: Arc<EngineState>,
}

#[async_trait]
impl Consumer for InProcessConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        RtpParameters(json!({ "codecs": [] }))
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::Relaxed)
    }

    fn score(&self) -> serde_json::Value {
        json!({ "score": 10, "producerScore": 10 })
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if !lock(&self.state.consumers).contains_key(&self.id) {
            return Err(EngineError::NotFound(format!("consumer {}", self.id)));
        }
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if !lock(&self.state.consumers).contains_key(&self.id) {
            return Err(EngineError::NotFound(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn set_preferred_layers(&self, _layers: ConsumerLayers) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_priority(&self, _priority: u8) -> Result<(), EngineError> {
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value, EngineError> {
        Ok(json!([{ "type": "consumer", "consumerId": self.id.to_string() }]))
    }

    fn close(&self) {
        lock(&self.state.consumers).remove(&self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::PeerId;

    async fn engine_with_router() -> (InProcessEngine, Arc<dyn Router>) {
        let engine = InProcessEngine::new(2);
        let worker = engine.worker_ids()[0];
        let router = engine
            .create_router(worker, &RouterCodecConfig::default())
            .await
            .unwrap();
        (engine, router)
    }

    fn produce_options(peer: &str, kind: MediaKind) -> ProduceOptions {
        ProduceOptions {
            kind,
            rtp_parameters: RtpParameters::default(),
            app_data: ProducerAppData {
                peer_id: PeerId::from(peer),
                source: match kind {
                    MediaKind::Audio => crate::types::MediaSource::Mic,
                    MediaKind::Video => crate::types::MediaSource::Webcam,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_router_registration_per_worker() {
        let (engine, router) = engine_with_router().await;
        let worker = engine.worker_ids()[0];

        assert_eq!(engine.worker_routers(worker), vec![router.id()]);
        assert!(engine.worker_routers(engine.worker_ids()[1]).is_empty());

        router.close();
        assert!(engine.worker_routers(worker).is_empty());
    }

    #[tokio::test]
    async fn test_produce_and_pipe() {
        let (engine, router) = engine_with_router().await;
        let other = engine
            .create_router(engine.worker_ids()[1], &RouterCodecConfig::default())
            .await
            .unwrap();

        let transport = router
            .create_transport(TransportOptions {
                producing: true,
                ..TransportOptions::default()
            })
            .await
            .unwrap();
        let bundle = transport
            .produce(produce_options("a", MediaKind::Audio))
            .await
            .unwrap();
        let producer_id = bundle.producer.id();

        assert!(router.has_producer(producer_id));
        assert!(!other.has_producer(producer_id));

        router
            .pipe_producer_to(producer_id, other.as_ref())
            .await
            .unwrap();
        assert!(other.has_producer(producer_id));
        assert_eq!(engine.piped_count(), 1);
    }

    #[tokio::test]
    async fn test_producer_close_notifies_consumers() {
        let (_engine, router) = engine_with_router().await;
        let transport = router
            .create_transport(TransportOptions {
                producing: true,
                consuming: true,
                ..TransportOptions::default()
            })
            .await
            .unwrap();

        let produced = transport
            .produce(produce_options("a", MediaKind::Video))
            .await
            .unwrap();
        let mut consumed = transport
            .consume(ConsumeOptions {
                producer_id: produced.producer.id(),
                rtp_capabilities: RtpCapabilities::default(),
                paused: true,
            })
            .await
            .unwrap();

        produced.producer.close();

        let event = consumed.events.recv().await.unwrap();
        assert!(matches!(event, ConsumerEvent::ProducerClose));
    }

    #[tokio::test]
    async fn test_pause_resume_events_reach_consumers() {
        let (_engine, router) = engine_with_router().await;
        let transport = router
            .create_transport(TransportOptions {
                producing: true,
                consuming: true,
                ..TransportOptions::default()
            })
            .await
            .unwrap();

        let produced = transport
            .produce(produce_options("a", MediaKind::Audio))
            .await
            .unwrap();
        let mut consumed = transport
            .consume(ConsumeOptions {
                producer_id: produced.producer.id(),
                rtp_capabilities: RtpCapabilities::default(),
                paused: false,
            })
            .await
            .unwrap();

        produced.producer.pause().await.unwrap();
        produced.producer.resume().await.unwrap();

        assert!(matches!(
            consumed.events.recv().await.unwrap(),
            ConsumerEvent::ProducerPause
        ));
        assert!(matches!(
            consumed.events.recv().await.unwrap(),
            ConsumerEvent::ProducerResume
        ));
    }

    #[tokio::test]
    async fn test_audio_observer_tracks_and_emits() {
        let (engine, router) = engine_with_router().await;
        let mut bundle = router
            .create_audio_level_observer(AudioLevelObserverConfig::default())
            .await
            .unwrap();

        let transport = router
            .create_transport(TransportOptions {
                producing: true,
                ..TransportOptions::default()
            })
            .await
            .unwrap();
        let produced = transport
            .produce(produce_options("a", MediaKind::Audio))
            .await
            .unwrap();

        bundle.observer.add_producer(produced.producer.id()).await.unwrap();
        assert_eq!(engine.observed_producers(router.id()), 1);

        engine.emit_volumes(
            router.id(),
            vec![VolumeEntry {
                producer_id: produced.producer.id(),
                peer_id: PeerId::from("a"),
                volume: -40,
            }],
        );
        assert!(matches!(
            bundle.events.recv().await.unwrap(),
            AudioLevelEvent::Volumes(_)
        ));

        engine.emit_silence(router.id());
        assert!(matches!(
            bundle.events.recv().await.unwrap(),
            AudioLevelEvent::Silence
        ));
    }

    #[tokio::test]
    async fn test_simulation_switches() {
        let (engine, router) = engine_with_router().await;
        let transport = router
            .create_transport(TransportOptions {
                producing: true,
                ..TransportOptions::default()
            })
            .await
            .unwrap();

        engine.set_fail_produce(true);
        let result = transport.produce(produce_options("a", MediaKind::Audio)).await;
        assert!(result.is_err());

        engine.set_fail_produce(false);
        let bundle = transport
            .produce(produce_options("a", MediaKind::Audio))
            .await
            .unwrap();

        engine.set_consumable(false);
        assert!(!router.can_consume(bundle.producer.id(), &RtpCapabilities::default()));
        engine.set_consumable(true);
        assert!(router.can_consume(bundle.producer.id(), &RtpCapabilities::default()));
    }
}
