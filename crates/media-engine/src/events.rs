//! Engine-originated events.

use crate::types::ConsumerLayers;
use common::types::{PeerId, ProducerId};

/// Events emitted by a producer.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    /// Transmission score report (opaque engine stats).
    Score(serde_json::Value),
    /// The owning transport closed; the producer is gone.
    TransportClose,
}

/// Events emitted by a consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// Reception score report (opaque engine stats).
    Score(serde_json::Value),
    /// The effective spatial/temporal layers changed (`None` = no layer).
    LayersChanged(Option<ConsumerLayers>),
    /// The consumed producer was paused at the origin.
    ProducerPause,
    /// The consumed producer was resumed at the origin.
    ProducerResume,
    /// The consumed producer closed; the consumer is gone.
    ProducerClose,
    /// The owning transport closed; the consumer is gone.
    TransportClose,
}

impl ConsumerEvent {
    /// Whether this event terminates the consumer.
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            ConsumerEvent::ProducerClose | ConsumerEvent::TransportClose
        )
    }
}

/// One loudest-producer report entry.
#[derive(Debug, Clone)]
pub struct VolumeEntry {
    pub producer_id: ProducerId,
    /// Peer id echoed from the producer's app data.
    pub peer_id: PeerId,
    /// Volume in dBvo (negative, 0 is loudest).
    pub volume: i16,
}

/// Events emitted by a router audio level observer.
#[derive(Debug, Clone)]
pub enum AudioLevelEvent {
    /// Loudest producers for the last interval, loudest first.
    Volumes(Vec<VolumeEntry>),
    /// No producer above the threshold during the last interval.
    Silence,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_close_class_events() {
        assert!(ConsumerEvent::ProducerClose.is_close());
        assert!(ConsumerEvent::TransportClose.is_close());
        assert!(!ConsumerEvent::ProducerPause.is_close());
        assert!(!ConsumerEvent::Score(serde_json::Value::Null).is_close());
    }
}
