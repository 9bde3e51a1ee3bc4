//! Media engine contract for Atrium.
//!
//! The room orchestration layer never talks to an SFU directly; it
//! consumes the trait surface defined here. A worker hosts routers,
//! routers host transports, transports produce and consume media
//! streams, and audio level observers report the loudest producer per
//! router. Routers are shared across rooms; producers, consumers, and
//! transports are exclusively owned by the peer that created them.
//!
//! Engine-originated events (consumer layer changes, producer closure,
//! audio levels) are delivered as typed values over `tokio::sync::mpsc`
//! receivers handed out at resource creation, so the owning room can
//! fold them into its own single-threaded timeline.

mod engine;
mod error;
mod events;
pub mod inprocess;
mod types;

pub use engine::{
    AudioLevelObserver, AudioLevelObserverBundle, Consumer, ConsumerBundle, MediaEngine, Producer,
    ProducerBundle, Router, Transport,
};
pub use error::EngineError;
pub use events::{AudioLevelEvent, ConsumerEvent, ProducerEvent, VolumeEntry};
pub use types::{
    AudioLevelObserverConfig, ConsumeOptions, ConsumerLayers, DtlsParameters, IceParameters,
    MediaKind, MediaSource, ProduceOptions, ProducerAppData, RouterCodecConfig, RtpCapabilities,
    RtpParameters, TransportOptions,
};
