//! Wire protocol: request and notification envelopes.
//!
//! Each peer holds one persistent connection carrying JSON frames:
//!
//! - client request:  `{"id": 7, "method": "join", "data": {...}}`,
//!   answered by exactly one reply `{"id": 7, "result": ...}` or
//!   `{"id": 7, "error": {"code": ..., "message": ...}}`
//! - server notification: `{"method": "newPeer", "data": {...}}`, no
//!   reply expected
//! - server request: `{"request": true, "id": 3, "method": ..., "data":
//!   ...}`, answered by a client reply frame `{"id": 3, "result": ...}`
//!
//! Request methods are an exhaustive tagged enum; a frame naming a method
//! outside the protocol fails with a distinguished "unknown method"
//! error rather than a generic parse failure.

use crate::access::RoleId;
use crate::errors::RoomError;
use crate::room::lobby::LobbyPeerInfo;
use crate::room::peer::PeerInfo;
use crate::turn::TurnServer;
use common::types::{ConsumerId, PeerId, ProducerId, TransportId};
use media_engine::{
    DtlsParameters, MediaKind, ProducerAppData, RtpCapabilities, RtpParameters,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Producer application data as sent by the client.
///
/// The source is kept as a raw string so an unknown source kind can be
/// rejected with a protocol error instead of a parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientAppData {
    #[serde(default)]
    pub source: Option<String>,
}

/// All request methods a peer may invoke.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    GetRouterRtpCapabilities {},
    Join {
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        picture: Option<String>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
        #[serde(default)]
        returning: bool,
    },
    CreateWebRtcTransport {
        #[serde(default)]
        force_tcp: bool,
        #[serde(default)]
        producing: bool,
        #[serde(default)]
        consuming: bool,
    },
    ConnectWebRtcTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    RestartIce {
        transport_id: TransportId,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: ClientAppData,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    PauseProducer {
        producer_id: ProducerId,
    },
    ResumeProducer {
        producer_id: ProducerId,
    },
    PauseConsumer {
        consumer_id: ConsumerId,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    SetConsumerPreferedLayers {
        consumer_id: ConsumerId,
        spatial_layer: u8,
        #[serde(default)]
        temporal_layer: Option<u8>,
    },
    SetConsumerPriority {
        consumer_id: ConsumerId,
        priority: u8,
    },
    RequestConsumerKeyFrame {
        consumer_id: ConsumerId,
    },
    GetTransportStats {
        transport_id: TransportId,
    },
    GetProducerStats {
        producer_id: ProducerId,
    },
    GetConsumerStats {
        consumer_id: ConsumerId,
    },
    ChangeDisplayName {
        display_name: String,
    },
    ChangePicture {
        picture: String,
    },
    ChatMessage {
        chat_message: Value,
    },
    #[serde(rename = "moderator:giveRole")]
    ModeratorGiveRole { peer_id: PeerId, role_id: RoleId },
    #[serde(rename = "moderator:removeRole")]
    ModeratorRemoveRole { peer_id: PeerId, role_id: RoleId },
    #[serde(rename = "moderator:clearChat")]
    ModeratorClearChat {},
    SetLocalRecording {
        local_recording_state: String,
    },
    LockRoom {},
    UnlockRoom {},
    SetAccessCode {
        access_code: String,
    },
    SetJoinByAccessCode {
        join_by_access_code: bool,
    },
    PromotePeer {
        peer_id: PeerId,
    },
    PromoteAllPeers {},
    SendFile(Value),
    RaisedHand {
        raised_hand: bool,
    },
    #[serde(rename = "moderator:mute")]
    ModeratorMute { peer_id: PeerId },
    #[serde(rename = "moderator:muteAll")]
    ModeratorMuteAll {},
    #[serde(rename = "moderator:stopVideo")]
    ModeratorStopVideo { peer_id: PeerId },
    #[serde(rename = "moderator:stopAllVideo")]
    ModeratorStopAllVideo {},
    #[serde(rename = "moderator:stopScreenSharing")]
    ModeratorStopScreenSharing { peer_id: PeerId },
    #[serde(rename = "moderator:stopAllScreenSharing")]
    ModeratorStopAllScreenSharing {},
    #[serde(rename = "moderator:closeMeeting")]
    ModeratorCloseMeeting {},
    #[serde(rename = "moderator:kickPeer")]
    ModeratorKickPeer { peer_id: PeerId },
    #[serde(rename = "moderator:lowerHand")]
    ModeratorLowerHand { peer_id: PeerId },
    AddConsentForRecording {
        consent: Value,
    },
}

/// Every method name in the protocol, used to distinguish "unknown
/// method" from "malformed payload" at the decode boundary.
const METHODS: &[&str] = &[
    "getRouterRtpCapabilities",
    "join",
    "createWebRtcTransport",
    "connectWebRtcTransport",
    "restartIce",
    "produce",
    "closeProducer",
    "pauseProducer",
    "resumeProducer",
    "pauseConsumer",
    "resumeConsumer",
    "setConsumerPreferedLayers",
    "setConsumerPriority",
    "requestConsumerKeyFrame",
    "getTransportStats",
    "getProducerStats",
    "getConsumerStats",
    "changeDisplayName",
    "changePicture",
    "chatMessage",
    "moderator:giveRole",
    "moderator:removeRole",
    "moderator:clearChat",
    "setLocalRecording",
    "lockRoom",
    "unlockRoom",
    "setAccessCode",
    "setJoinByAccessCode",
    "promotePeer",
    "promoteAllPeers",
    "sendFile",
    "raisedHand",
    "moderator:mute",
    "moderator:muteAll",
    "moderator:stopVideo",
    "moderator:stopAllVideo",
    "moderator:stopScreenSharing",
    "moderator:stopAllScreenSharing",
    "moderator:closeMeeting",
    "moderator:kickPeer",
    "moderator:lowerHand",
    "addConsentForRecording",
];

impl ClientRequest {
    /// Parse a request from its method name and payload.
    pub fn parse(method: &str, data: Value) -> Result<Self, RoomError> {
        if !METHODS.contains(&method) {
            return Err(RoomError::UnknownMethod(method.to_string()));
        }
        let data = if data.is_null() { json!({}) } else { data };
        serde_json::from_value(json!({ "method": method, "data": data }))
            .map_err(|err| RoomError::BadRequest(err.to_string()))
    }

    /// The wire name of this request's method.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::GetRouterRtpCapabilities {} => "getRouterRtpCapabilities",
            ClientRequest::Join { .. } => "join",
            ClientRequest::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ClientRequest::ConnectWebRtcTransport { .. } => "connectWebRtcTransport",
            ClientRequest::RestartIce { .. } => "restartIce",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::CloseProducer { .. } => "closeProducer",
            ClientRequest::PauseProducer { .. } => "pauseProducer",
            ClientRequest::ResumeProducer { .. } => "resumeProducer",
            ClientRequest::PauseConsumer { .. } => "pauseConsumer",
            ClientRequest::ResumeConsumer { .. } => "resumeConsumer",
            ClientRequest::SetConsumerPreferedLayers { .. } => "setConsumerPreferedLayers",
            ClientRequest::SetConsumerPriority { .. } => "setConsumerPriority",
            ClientRequest::RequestConsumerKeyFrame { .. } => "requestConsumerKeyFrame",
            ClientRequest::GetTransportStats { .. } => "getTransportStats",
            ClientRequest::GetProducerStats { .. } => "getProducerStats",
            ClientRequest::GetConsumerStats { .. } => "getConsumerStats",
            ClientRequest::ChangeDisplayName { .. } => "changeDisplayName",
            ClientRequest::ChangePicture { .. } => "changePicture",
            ClientRequest::ChatMessage { .. } => "chatMessage",
            ClientRequest::ModeratorGiveRole { .. } => "moderator:giveRole",
            ClientRequest::ModeratorRemoveRole { .. } => "moderator:removeRole",
            ClientRequest::ModeratorClearChat {} => "moderator:clearChat",
            ClientRequest::SetLocalRecording { .. } => "setLocalRecording",
            ClientRequest::LockRoom {} => "lockRoom",
            ClientRequest::UnlockRoom {} => "unlockRoom",
            ClientRequest::SetAccessCode { .. } => "setAccessCode",
            ClientRequest::SetJoinByAccessCode { .. } => "setJoinByAccessCode",
            ClientRequest::PromotePeer { .. } => "promotePeer",
            ClientRequest::PromoteAllPeers {} => "promoteAllPeers",
            ClientRequest::SendFile(_) => "sendFile",
            ClientRequest::RaisedHand { .. } => "raisedHand",
            ClientRequest::ModeratorMute { .. } => "moderator:mute",
            ClientRequest::ModeratorMuteAll {} => "moderator:muteAll",
            ClientRequest::ModeratorStopVideo { .. } => "moderator:stopVideo",
            ClientRequest::ModeratorStopAllVideo {} => "moderator:stopAllVideo",
            ClientRequest::ModeratorStopScreenSharing { .. } => "moderator:stopScreenSharing",
            ClientRequest::ModeratorStopAllScreenSharing {} => "moderator:stopAllScreenSharing",
            ClientRequest::ModeratorCloseMeeting {} => "moderator:closeMeeting",
            ClientRequest::ModeratorKickPeer { .. } => "moderator:kickPeer",
            ClientRequest::ModeratorLowerHand { .. } => "moderator:lowerHand",
            ClientRequest::AddConsentForRecording { .. } => "addConsentForRecording",
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum ClientFrame {
    /// A request expecting exactly one reply.
    Request { id: u64, request: ClientRequest },
    /// A request whose method is unknown or whose payload is malformed;
    /// carried so the dispatcher can still send a correlated error reply.
    BadRequest { id: u64, error: RoomError },
    /// A reply to a server-initiated request.
    Reply {
        id: u64,
        error: Option<Value>,
        result: Option<Value>,
    },
}

/// Raw frame shape used for decoding.
#[derive(Debug, Deserialize)]
struct RawFrame {
    id: u64,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

impl ClientFrame {
    /// Decode one inbound frame. Frames carrying a `method` are requests;
    /// the rest are replies to server-initiated requests.
    pub fn decode(text: &str) -> Result<Self, RoomError> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|err| RoomError::BadRequest(err.to_string()))?;

        match raw.method {
            Some(method) => match ClientRequest::parse(&method, raw.data) {
                Ok(request) => Ok(ClientFrame::Request {
                    id: raw.id,
                    request,
                }),
                Err(error) => Ok(ClientFrame::BadRequest { id: raw.id, error }),
            },
            None => Ok(ClientFrame::Reply {
                id: raw.id,
                error: raw.error,
                result: raw.result,
            }),
        }
    }
}

/// Error payload of a reply frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyError {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub not_found_in_media_engine: bool,
}

impl From<&RoomError> for ReplyError {
    fn from(err: &RoomError) -> Self {
        Self {
            code: err.error_code(),
            message: err.client_message(),
            not_found_in_media_engine: err.is_not_found_in_engine(),
        }
    }
}

/// All notification methods the room sends to peers.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    NewPeer {
        #[serde(flatten)]
        peer: PeerInfo,
        returning: bool,
    },
    PeerClosed {
        peer_id: PeerId,
    },
    NewConsumer {
        peer_id: PeerId,
        kind: MediaKind,
        producer_id: ProducerId,
        id: ConsumerId,
        rtp_parameters: RtpParameters,
        #[serde(rename = "type")]
        consumer_type: String,
        app_data: ProducerAppData,
        producer_paused: bool,
        score: Value,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
    ConsumerPaused {
        consumer_id: ConsumerId,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ConsumerLayersChanged {
        consumer_id: ConsumerId,
        spatial_layer: Option<u8>,
        temporal_layer: Option<u8>,
    },
    ConsumerScore {
        consumer_id: ConsumerId,
        score: Value,
    },
    ProducerScore {
        producer_id: ProducerId,
        score: Value,
    },
    ActiveSpeaker {
        peer_id: Option<PeerId>,
        volume: i16,
    },
    ParkedPeer {
        peer_id: PeerId,
    },
    ParkedPeers {
        lobby_peers: Vec<LobbyPeerInfo>,
    },
    #[serde(rename = "lobby:promotedPeer")]
    LobbyPromotedPeer { peer_id: PeerId },
    #[serde(rename = "lobby:peerClosed")]
    LobbyPeerClosed { peer_id: PeerId },
    #[serde(rename = "lobby:changeDisplayName")]
    LobbyChangeDisplayName {
        peer_id: PeerId,
        display_name: String,
    },
    #[serde(rename = "lobby:changePicture")]
    LobbyChangePicture { peer_id: PeerId, picture: String },
    OverRoomLimit,
    SignInRequired,
    RoomBack,
    RoomReady {
        turn_servers: Option<Vec<TurnServer>>,
    },
    ChangeDisplayName {
        peer_id: PeerId,
        display_name: String,
        old_display_name: String,
    },
    ChangePicture {
        peer_id: PeerId,
        picture: String,
    },
    ChatMessage {
        peer_id: PeerId,
        chat_message: Value,
    },
    #[serde(rename = "moderator:clearChat")]
    ModeratorClearChat,
    SetLocalRecording {
        peer_id: PeerId,
        local_recording_state: String,
    },
    LockRoom {
        peer_id: PeerId,
    },
    UnlockRoom {
        peer_id: PeerId,
    },
    SetAccessCode {
        peer_id: PeerId,
        access_code: String,
    },
    SetJoinByAccessCode {
        peer_id: PeerId,
        join_by_access_code: bool,
    },
    SendFile(Value),
    RaisedHand {
        peer_id: PeerId,
        raised_hand: bool,
        raised_hand_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    },
    GotRole {
        peer_id: PeerId,
        role_id: RoleId,
    },
    LostRole {
        peer_id: PeerId,
        role_id: RoleId,
    },
    #[serde(rename = "moderator:mute")]
    ModeratorMute,
    #[serde(rename = "moderator:stopVideo")]
    ModeratorStopVideo,
    #[serde(rename = "moderator:stopScreenSharing")]
    ModeratorStopScreenSharing,
    #[serde(rename = "moderator:kick")]
    ModeratorKick,
    #[serde(rename = "moderator:lowerHand")]
    ModeratorLowerHand,
    AddConsentForRecording {
        peer_id: PeerId,
        consent: Value,
    },
}

impl Notification {
    /// Serialize to the wire envelope.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
