//! The engine trait surface.
//!
//! Handles are `Arc<dyn Trait>` so a resource can be held by its owning
//! peer while event relays and piping logic reference it. `close()` is
//! synchronous and idempotent on every handle; releasing the last
//! reference after close is always safe.

use crate::error::EngineError;
use crate::events::{AudioLevelEvent, ConsumerEvent, ProducerEvent};
use crate::types::{
    AudioLevelObserverConfig, ConsumeOptions, ConsumerLayers, DtlsParameters, IceParameters,
    MediaKind, ProduceOptions, ProducerAppData, RouterCodecConfig, RtpCapabilities, RtpParameters,
    TransportOptions,
};
use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A running media engine: a set of workers, each hosting routers.
///
/// Workers and routers are shared across rooms. The worker/router
/// topology queries are synchronous snapshots used by the load balancer;
/// they may be stale by the time they are acted on, which the balancer
/// tolerates.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// All worker ids, in a stable order.
    fn worker_ids(&self) -> Vec<WorkerId>;

    /// All router ids currently hosted by a worker (across rooms), in a
    /// stable order. Unknown workers yield an empty list.
    fn worker_routers(&self, worker_id: WorkerId) -> Vec<RouterId>;

    /// Create a router on the given worker.
    async fn create_router(
        &self,
        worker_id: WorkerId,
        codecs: &RouterCodecConfig,
    ) -> Result<Arc<dyn Router>, EngineError>;
}

/// A router hosted by a worker.
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> RouterId;

    fn worker_id(&self) -> WorkerId;

    /// RTP capabilities clients need before consuming.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a receiver with the given capabilities can consume the
    /// producer's encoding.
    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    /// Whether the producer's media is already present on this router
    /// (either produced here or piped in).
    fn has_producer(&self, producer_id: ProducerId) -> bool;

    /// Relay a producer's media from this router to `destination`.
    async fn pipe_producer_to(
        &self,
        producer_id: ProducerId,
        destination: &dyn Router,
    ) -> Result<(), EngineError>;

    /// Create a transport for one peer on this router.
    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    /// Create an audio level observer reporting the loudest producer.
    async fn create_audio_level_observer(
        &self,
        config: AudioLevelObserverConfig,
    ) -> Result<AudioLevelObserverBundle, EngineError>;

    fn close(&self);
}

/// An audio level observer and its event stream.
pub struct AudioLevelObserverBundle {
    pub observer: Arc<dyn AudioLevelObserver>,
    pub events: mpsc::UnboundedReceiver<AudioLevelEvent>,
}

/// Observes audio producers on one router.
#[async_trait]
pub trait AudioLevelObserver: Send + Sync {
    async fn add_producer(&self, producer_id: ProducerId) -> Result<(), EngineError>;

    async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), EngineError>;

    fn close(&self);
}

/// A peer's transport on a router.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Whether the client declared intent to send media on this transport.
    fn producing(&self) -> bool;

    /// Whether the client declared intent to receive media on this transport.
    fn consuming(&self) -> bool;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> serde_json::Value;

    fn dtls_parameters(&self) -> DtlsParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn restart_ice(&self) -> Result<IceParameters, EngineError>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    /// Create a producer for an outbound stream.
    async fn produce(&self, options: ProduceOptions) -> Result<ProducerBundle, EngineError>;

    /// Create a consumer for an inbound stream.
    async fn consume(&self, options: ConsumeOptions) -> Result<ConsumerBundle, EngineError>;

    async fn stats(&self) -> Result<serde_json::Value, EngineError>;

    fn close(&self);
}

/// A producer and its event stream.
pub struct ProducerBundle {
    pub producer: Arc<dyn Producer>,
    pub events: mpsc::UnboundedReceiver<ProducerEvent>,
}

/// A consumer and its event stream.
pub struct ConsumerBundle {
    pub consumer: Arc<dyn Consumer>,
    pub events: mpsc::UnboundedReceiver<ConsumerEvent>,
}

/// An outbound media stream owned by one peer.
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn app_data(&self) -> ProducerAppData;

    fn paused(&self) -> bool;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn stats(&self) -> Result<serde_json::Value, EngineError>;

    fn close(&self);
}

/// An inbound media stream owned by one peer.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Engine-specific consumer type ("simple", "simulcast", ...).
    fn consumer_type(&self) -> String;

    /// Whether the consumed producer is currently paused.
    fn producer_paused(&self) -> bool;

    /// Last reported reception score (opaque engine stats).
    fn score(&self) -> serde_json::Value;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError>;

    /// Request relay priority for this consumer (255 = maximum).
    async fn set_priority(&self, priority: u8) -> Result<(), EngineError>;

    async fn request_key_frame(&self) -> Result<(), EngineError>;

    async fn stats(&self) -> Result<serde_json::Value, EngineError>;

    fn close(&self);
}
