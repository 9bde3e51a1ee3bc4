//! Value types crossing the engine boundary.
//!
//! RTP/ICE/DTLS parameter blobs are negotiated between the engine and
//! clients; the orchestration layer only moves them around, so they are
//! kept as opaque JSON newtypes.

use common::types::{PeerId, ProducerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// RTP capabilities declared by a router or a receiving peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpCapabilities(pub serde_json::Value);

/// RTP parameters of a produced or consumed stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpParameters(pub serde_json::Value);

/// DTLS parameters used to connect a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DtlsParameters(pub serde_json::Value);

/// ICE parameters of a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceParameters(pub serde_json::Value);

/// Router media codec configuration, passed through to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterCodecConfig(pub serde_json::Value);

/// Kind of a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Declared source of a produced stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Mic,
    Webcam,
    Screen,
    #[serde(rename = "extravideo")]
    ExtraVideo,
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Mic => f.write_str("mic"),
            MediaSource::Webcam => f.write_str("webcam"),
            MediaSource::Screen => f.write_str("screen"),
            MediaSource::ExtraVideo => f.write_str("extravideo"),
        }
    }
}

/// Application data attached to a producer.
///
/// The engine stores this verbatim and echoes the peer id back in audio
/// level events, which is how volume reports are attributed to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAppData {
    pub peer_id: PeerId,
    pub source: MediaSource,
}

/// Options for creating a peer transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportOptions {
    /// Restrict the transport to TCP.
    pub force_tcp: bool,
    /// The client intends to send media over this transport.
    pub producing: bool,
    /// The client intends to receive media over this transport.
    pub consuming: bool,
}

/// Options for producing a stream on a transport.
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: ProducerAppData,
}

/// Options for consuming a producer on a transport.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    /// Create the consumer paused; the client resumes it after ack.
    pub paused: bool,
}

/// Preferred spatial/temporal layers for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

/// Configuration of a router audio level observer.
#[derive(Debug, Clone, Copy)]
pub struct AudioLevelObserverConfig {
    /// Number of loudest entries reported per interval.
    pub max_entries: u16,
    /// Minimum volume in dBvo considered speech.
    pub threshold: i16,
    /// Reporting interval in milliseconds.
    pub interval_ms: u32,
}

impl Default for AudioLevelObserverConfig {
    fn default() -> Self {
        Self {
            max_entries: 1,
            threshold: -80,
            interval_ms: 800,
        }
    }
}
