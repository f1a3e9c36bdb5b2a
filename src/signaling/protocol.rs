#![forbid(unsafe_code)]

// Wire protocol for the signaling socket. Events are internally tagged with
// `type`; SDP and candidate payloads stay opaque JSON — the relay rewrites
// the envelope, never the contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::UserSnapshot;
use crate::media::types::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDirection,
};
use crate::media::SfuRoomStats;
use crate::room::participant::{MediaState, MediaStateUpdate, ParticipantRole};
use crate::room::settings::RoomSettings;
use crate::store::CallStatus;
use crate::turn::IceServer;

/// Client-to-server events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "room:join", rename_all = "camelCase")]
    RoomJoin {
        room_id: String,
        #[serde(default)]
        passcode: Option<String>,
        /// Legacy field; authentication happens at the handshake.
        #[serde(default)]
        token: Option<String>,
    },

    #[serde(rename = "room:create", rename_all = "camelCase")]
    RoomCreate {
        name: String,
        #[serde(default)]
        is_private: Option<bool>,
        #[serde(default)]
        max_participants: Option<u32>,
        #[serde(default)]
        id: Option<String>,
    },

    #[serde(rename = "room:leave", rename_all = "camelCase")]
    RoomLeave {
        #[serde(default)]
        room_id: Option<String>,
    },

    #[serde(rename = "room:end-call", rename_all = "camelCase")]
    RoomEndCall { room_id: String },

    #[serde(rename = "participant:update-media-state")]
    UpdateMediaState(MediaStateUpdate),

    #[serde(rename = "webrtc:offer")]
    WebrtcOffer { to: String, offer: serde_json::Value },

    #[serde(rename = "webrtc:answer")]
    WebrtcAnswer { to: String, answer: serde_json::Value },

    #[serde(rename = "webrtc:ice-candidate")]
    WebrtcIceCandidate { to: String, candidate: serde_json::Value },

    #[serde(rename = "webrtc:get-ice-servers")]
    WebrtcGetIceServers,

    #[serde(rename = "sfu:join-room", rename_all = "camelCase")]
    SfuJoinRoom {
        room_id: String,
        #[serde(default)]
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename = "sfu:create-transport", rename_all = "camelCase")]
    SfuCreateTransport { direction: TransportDirection },

    #[serde(rename = "sfu:connect-transport", rename_all = "camelCase")]
    SfuConnectTransport { dtls_parameters: DtlsParameters },

    #[serde(rename = "sfu:produce", rename_all = "camelCase")]
    SfuProduce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    #[serde(rename = "sfu:consume", rename_all = "camelCase")]
    SfuConsume {
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename = "sfu:resume-consumer", rename_all = "camelCase")]
    SfuResumeConsumer { consumer_id: String },

    #[serde(rename = "sfu:pause-producer", rename_all = "camelCase")]
    SfuPauseProducer { pause: bool },

    #[serde(rename = "chat:message")]
    ChatMessage {
        message: String,
        #[serde(default)]
        to: Option<String>,
    },

    #[serde(rename = "chat:typing", rename_all = "camelCase")]
    ChatTyping { is_typing: bool },

    #[serde(rename = "admin:get-room-stats", rename_all = "camelCase")]
    AdminGetRoomStats { room_id: String },

    #[serde(rename = "admin:get-all-rooms")]
    AdminGetAllRooms,
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "room:created", rename_all = "camelCase")]
    RoomCreated {
        room_id: String,
        settings: RoomSettings,
    },

    #[serde(rename = "room:joined", rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        user: UserSnapshot,
        participants: Vec<ParticipantInfo>,
        settings: RoomSettings,
        is_host: bool,
    },

    #[serde(rename = "room:user-joined", rename_all = "camelCase")]
    RoomUserJoined {
        user: UserSnapshot,
        participant: ParticipantInfo,
    },

    #[serde(rename = "room:user-left", rename_all = "camelCase")]
    RoomUserLeft {
        user_id: String,
        participant: ParticipantInfo,
    },

    #[serde(rename = "room:call-ended", rename_all = "camelCase")]
    RoomCallEnded { room_id: String, reason: String },

    #[serde(rename = "participant:media-state-changed", rename_all = "camelCase")]
    MediaStateChanged {
        user_id: String,
        peer_id: String,
        media_state: MediaState,
    },

    #[serde(rename = "webrtc:offer", rename_all = "camelCase")]
    WebrtcOffer {
        from: String,
        to: String,
        offer: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<UserSnapshot>,
    },

    #[serde(rename = "webrtc:answer", rename_all = "camelCase")]
    WebrtcAnswer {
        from: String,
        to: String,
        answer: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<UserSnapshot>,
    },

    #[serde(rename = "webrtc:ice-candidate", rename_all = "camelCase")]
    WebrtcIceCandidate {
        from: String,
        to: String,
        candidate: serde_json::Value,
    },

    #[serde(rename = "webrtc:ice-servers", rename_all = "camelCase")]
    WebrtcIceServers { ice_servers: Vec<IceServer> },

    #[serde(rename = "sfu:router-rtp-capabilities", rename_all = "camelCase")]
    SfuRouterRtpCapabilities { rtp_capabilities: RtpCapabilities },

    #[serde(rename = "sfu:transport-created", rename_all = "camelCase")]
    SfuTransportCreated {
        id: String,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },

    #[serde(rename = "sfu:transport-connected", rename_all = "camelCase")]
    SfuTransportConnected { direction: TransportDirection },

    #[serde(rename = "sfu:producer-created", rename_all = "camelCase")]
    SfuProducerCreated { id: String },

    #[serde(rename = "sfu:consumer-created", rename_all = "camelCase")]
    SfuConsumerCreated {
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_peer_id: String,
    },

    #[serde(rename = "sfu:consumer-closed", rename_all = "camelCase")]
    SfuConsumerClosed { consumer_id: String },

    #[serde(rename = "sfu:consumer-resumed", rename_all = "camelCase")]
    SfuConsumerResumed { consumer_id: String },

    #[serde(rename = "sfu:producer-paused", rename_all = "camelCase")]
    SfuProducerPaused { producer_id: String, paused: bool },

    #[serde(rename = "sfu:new-producer", rename_all = "camelCase")]
    SfuNewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },

    #[serde(rename = "chat:message", rename_all = "camelCase")]
    ChatMessage {
        id: String,
        room_id: String,
        from: String,
        user: UserSnapshot,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "chat:typing", rename_all = "camelCase")]
    ChatTyping {
        peer_id: String,
        user_id: String,
        is_typing: bool,
    },

    #[serde(rename = "admin:room-stats", rename_all = "camelCase")]
    AdminRoomStats { stats: RoomStatsInfo },

    #[serde(rename = "admin:all-rooms", rename_all = "camelCase")]
    AdminAllRooms { rooms: Vec<RoomStatsInfo> },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// Participant snapshot for room state events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub peer_id: String,
    pub user_id: String,
    pub user: UserSnapshot,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub media_state: MediaState,
}

/// Diagnostic room snapshot for the admin surface. Never carries secrets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatsInfo {
    pub room_id: String,
    pub name: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub participant_count: usize,
    pub connected_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sfu: Option<SfuRoomStats>,
}
