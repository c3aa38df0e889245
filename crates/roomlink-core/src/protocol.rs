//! Wire protocol
//!
//! Two closed message sets:
//!
//! * [`SignalingMessage`] travels over the relayed channel as JSON text,
//!   tagged by a kebab-case `"type"` field.
//! * [`PeerFrame`] travels over direct links as bincode, with a big-endian
//!   `u32` length prefix on stream transports. Bridge traffic relayed through
//!   the coordinator wraps a `PeerFrame` in [`SignalingMessage::Relay`].

use serde::{Deserialize, Serialize};

use crate::bridge::{BridgeEnvelope, NackReason};
use crate::errors::{Result, RoomlinkError};
use crate::message::ChatMessage;
use crate::presence::PresenceRecord;
use crate::types::{MessageId, PeerId, RoomId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Largest accepted direct-link frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Length prefix size on stream transports
pub const FRAME_HEADER_LEN: usize = 4;

/// Error codes carried by [`SignalingMessage::Error`]
pub mod error_codes {
    pub const PEER_NOT_FOUND: &str = "peer-not-found";
    pub const BAD_FRAME: &str = "bad-frame";
    pub const NOT_JOINED: &str = "not-joined";
    pub const INVALID_MESSAGE: &str = "invalid-message";
    pub const ROOM_FULL: &str = "room-full";
}

/// Reasons carried by [`SignalingMessage::PeerLeft`]
pub mod leave_reasons {
    pub const LEFT: &str = "left";
    pub const DISCONNECTED: &str = "disconnected";
    pub const REPLACED: &str = "replaced";
    pub const TIMEOUT: &str = "timeout";
}

// ----------------------------------------------------------------------------
// Signaling Messages
// ----------------------------------------------------------------------------

/// Roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
}

/// Messages exchanged with the coordinator over the relayed channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        display_name: String,
    },
    /// Reply to `join-room`: everyone else already in the room
    Roster { room_id: RoomId, peers: Vec<PeerInfo> },
    LeaveRoom,
    PeerJoined { peer_id: PeerId, display_name: String },
    PeerLeft {
        peer_id: PeerId,
        display_name: String,
        reason: String,
    },
    ChatMessage { room_id: RoomId, message: ChatMessage },
    DeliveryAck {
        message_id: MessageId,
        delivered_at: Timestamp,
    },
    RequestConnection {
        target_peer_id: PeerId,
        from_peer_id: PeerId,
        /// Dialable direct-transport address of the requester
        address: String,
    },
    ConnectionResponse {
        target_peer_id: PeerId,
        from_peer_id: PeerId,
        accepted: bool,
        /// Dialable address of the responder when accepted
        #[serde(default)]
        address: Option<String>,
    },
    HealthPing { timestamp: Timestamp },
    HealthPong {
        timestamp: Timestamp,
        original_timestamp: Timestamp,
    },
    Presence { record: PresenceRecord },
    /// Opaque direct-link frame delivered by coordinator unicast
    Relay {
        target_peer_id: PeerId,
        from_peer_id: PeerId,
        envelope: PeerFrame,
    },
    Error { code: String, detail: String },
}

impl SignalingMessage {
    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn error<C: Into<String>, D: Into<String>>(code: C, detail: D) -> Self {
        SignalingMessage::Error {
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Wire tag, used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::JoinRoom { .. } => "join-room",
            SignalingMessage::Roster { .. } => "roster",
            SignalingMessage::LeaveRoom => "leave-room",
            SignalingMessage::PeerJoined { .. } => "peer-joined",
            SignalingMessage::PeerLeft { .. } => "peer-left",
            SignalingMessage::ChatMessage { .. } => "chat-message",
            SignalingMessage::DeliveryAck { .. } => "delivery-ack",
            SignalingMessage::RequestConnection { .. } => "request-connection",
            SignalingMessage::ConnectionResponse { .. } => "connection-response",
            SignalingMessage::HealthPing { .. } => "health-ping",
            SignalingMessage::HealthPong { .. } => "health-pong",
            SignalingMessage::Presence { .. } => "presence",
            SignalingMessage::Relay { .. } => "relay",
            SignalingMessage::Error { .. } => "error",
        }
    }
}

// ----------------------------------------------------------------------------
// Direct-Link Frames
// ----------------------------------------------------------------------------

/// Frames exchanged over a direct link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// First frame on a freshly dialed link
    Hello { peer_id: PeerId, room_id: RoomId },
    Chat(ChatMessage),
    /// Round-trip probe; `padding` feeds the bandwidth estimate
    Probe {
        nonce: u64,
        sent_at: Timestamp,
        padding: Vec<u8>,
    },
    ProbeReply {
        nonce: u64,
        sent_at: Timestamp,
        padding_len: u32,
    },
    Presence(PresenceRecord),
    Bridge(BridgeEnvelope),
    BridgeAck {
        message_id: MessageId,
        origin: PeerId,
        recipient: PeerId,
    },
    BridgeNack {
        message_id: MessageId,
        origin: PeerId,
        recipient: PeerId,
        reason: NackReason,
    },
    Close { reason: String },
}

impl PeerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerFrame::Hello { .. } => "hello",
            PeerFrame::Chat(_) => "chat",
            PeerFrame::Probe { .. } => "probe",
            PeerFrame::ProbeReply { .. } => "probe-reply",
            PeerFrame::Presence(_) => "presence",
            PeerFrame::Bridge(_) => "bridge",
            PeerFrame::BridgeAck { .. } => "bridge-ack",
            PeerFrame::BridgeNack { .. } => "bridge-nack",
            PeerFrame::Close { .. } => "close",
        }
    }
}

/// Serialize a frame body without the length prefix
pub fn encode_frame_body(frame: &PeerFrame) -> Result<Vec<u8>> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RoomlinkError::invalid_message(format!(
            "Frame of {} bytes exceeds maximum {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    Ok(body)
}

/// Serialize a frame with its `u32` big-endian length prefix
pub fn encode_frame(frame: &PeerFrame) -> Result<Vec<u8>> {
    let body = encode_frame_body(frame)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a frame body
pub fn decode_frame_body(body: &[u8]) -> Result<PeerFrame> {
    if body.len() > MAX_FRAME_LEN {
        return Err(RoomlinkError::invalid_message("Frame exceeds maximum length"));
    }
    Ok(bincode::deserialize(body)?)
}

/// Validate a length prefix read from a stream
pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(RoomlinkError::invalid_message(format!(
            "Invalid frame length {len}"
        )));
    }
    Ok(len)
}

// ----------------------------------------------------------------------------
// Stream Decoder
// ----------------------------------------------------------------------------

/// Incremental decoder for length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, if the buffer holds one
    pub fn next_frame(&mut self) -> Result<Option<PeerFrame>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let len = frame_len(header)?;
        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let frame = decode_frame_body(&self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])?;
        self.buffer.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(frame))
    }
}
