//! Commands into and events out of a running client

use roomlink_core::{
    ChatMessage, HealthSignal, InboundPath, MessageId, PeerId, PeerInfo, Priority, QualityTier,
    RelayHealth, RoomId, RouteReport, RoomlinkResult, RoutingStats, Timestamp,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::mesh::LinkSnapshot;

// ----------------------------------------------------------------------------
// App Events
// ----------------------------------------------------------------------------

/// Everything the UI layer needs to hear about
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Room joined; `peers` is everyone else already present
    Joined { room_id: RoomId, peers: Vec<PeerInfo> },
    PeerJoined { peer_id: PeerId, display_name: String },
    PeerLeft {
        peer_id: PeerId,
        display_name: String,
        reason: String,
    },
    /// The relayed channel came back after too long a gap; call
    /// `confirm_rejoin` to resume the session
    RejoinConfirmationRequired {
        room_id: RoomId,
        display_name: String,
        gap: Duration,
    },
    MessageReceived {
        message: ChatMessage,
        path: InboundPath,
    },
    /// First confirmation of one of our own messages
    MessageDelivered {
        message_id: MessageId,
        delivered_at: Timestamp,
    },
    MessageFailed { message_id: MessageId, reason: String },
    HistoryReplayed {
        room_id: RoomId,
        messages: Vec<ChatMessage>,
    },
    ConnectionQualityChanged {
        peer_id: PeerId,
        tier: QualityTier,
        score: u8,
        degraded: bool,
    },
    HealthChanged { signal: HealthSignal },
    /// Relayed reconnection budget spent; retries continue at the capped delay
    CoordinatorUnreachable { attempts: u32 },
}

pub type AppEventSender = mpsc::UnboundedSender<AppEvent>;
pub type AppEventReceiver = mpsc::UnboundedReceiver<AppEvent>;

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Requests from a [`crate::client::ClientHandle`] to its task
#[derive(Debug)]
pub enum ClientCommand {
    Join {
        room_id: RoomId,
        display_name: String,
        reply: oneshot::Sender<RoomlinkResult<Vec<PeerInfo>>>,
    },
    Leave,
    /// Resume the remembered session, optionally under a new display name
    ConfirmRejoin { display_name: Option<String> },
    Send {
        content: String,
        priority: Priority,
        reply: oneshot::Sender<RoomlinkResult<RouteReport>>,
    },
    /// Attempt a direct link right away instead of waiting for discovery
    Upgrade {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    HealthSnapshot {
        reply: oneshot::Sender<HealthSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of a client's connectivity
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub peer_id: PeerId,
    pub room_id: Option<RoomId>,
    pub signal: HealthSignal,
    pub relay: RelayHealth,
    pub relay_rtt: Option<Duration>,
    pub links: Vec<LinkSnapshot>,
    pub stats: RoutingStats,
    pub queued: usize,
}
