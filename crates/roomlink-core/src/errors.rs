//! Error types for the Roomlink connection core
//!
//! The taxonomy mirrors how failures are *handled*, not just where they come
//! from: every variant maps to a [`Disposition`] that tells the caller whether
//! it is recovered silently, reported as a status change, counted in
//! statistics only, or surfaced as a user-visible banner.

use crate::link::StateTransitionError;

// ----------------------------------------------------------------------------
// Disposition
// ----------------------------------------------------------------------------

/// How an error is propagated once local recovery is done with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Recovered locally, never surfaced
    Silent,
    /// Surfaced as a non-fatal status change ("searching for connection")
    StatusChange,
    /// Reported in routing statistics only
    StatsOnly,
    /// User-visible error banner
    Banner,
    /// Programming or configuration error
    Fatal,
}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error types for the Roomlink protocol
#[derive(Debug, thiserror::Error)]
pub enum RoomlinkError {
    #[error("Connection to peer {peer_id} timed out after {duration_ms}ms")]
    ConnectionTimeout { peer_id: String, duration_ms: u64 },

    #[error("Peer not found: {peer_id}")]
    PeerUnavailable { peer_id: String },

    #[error("Direct connection to {peer_id} already exists")]
    DuplicateConnection { peer_id: String },

    #[error("Network degraded towards {peer_id} (quality {quality})")]
    NetworkDegraded { peer_id: String, quality: u8 },

    #[error("Bridge relay exhausted after {hops} hops")]
    RelayExhausted { hops: u8 },

    #[error("Coordinator unreachable: {reason}")]
    CoordinatorUnreachable { reason: String },

    #[error("Session is stale, identity must be re-confirmed for room {room_id}")]
    SessionStale { room_id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Room {room_id} is full ({limit} participants)")]
    RoomFull { room_id: String, limit: usize },

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Channel communication error between runtime tasks
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl RoomlinkError {
    /// Create a connection timeout error
    pub fn connection_timeout<P: ToString>(peer_id: P, duration: core::time::Duration) -> Self {
        RoomlinkError::ConnectionTimeout {
            peer_id: peer_id.to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a peer unavailable error
    pub fn peer_unavailable<P: ToString>(peer_id: P) -> Self {
        RoomlinkError::PeerUnavailable {
            peer_id: peer_id.to_string(),
        }
    }

    /// Create a duplicate connection error
    pub fn duplicate_connection<P: ToString>(peer_id: P) -> Self {
        RoomlinkError::DuplicateConnection {
            peer_id: peer_id.to_string(),
        }
    }

    /// Create a network degraded error
    pub fn network_degraded<P: ToString>(peer_id: P, quality: u8) -> Self {
        RoomlinkError::NetworkDegraded {
            peer_id: peer_id.to_string(),
            quality,
        }
    }

    /// Create a coordinator unreachable error
    pub fn coordinator_unreachable<T: Into<String>>(reason: T) -> Self {
        RoomlinkError::CoordinatorUnreachable {
            reason: reason.into(),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message<T: Into<String>>(reason: T) -> Self {
        RoomlinkError::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        RoomlinkError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        RoomlinkError::Configuration {
            reason: reason.into(),
        }
    }

    /// How this error is propagated after local recovery
    pub fn disposition(&self) -> Disposition {
        match self {
            RoomlinkError::DuplicateConnection { .. } => Disposition::Silent,
            RoomlinkError::NetworkDegraded { .. } => Disposition::Silent,
            RoomlinkError::ConnectionTimeout { .. } | RoomlinkError::PeerUnavailable { .. } => {
                Disposition::StatusChange
            }
            RoomlinkError::SessionStale { .. } => Disposition::StatusChange,
            RoomlinkError::RelayExhausted { .. } => Disposition::StatsOnly,
            RoomlinkError::CoordinatorUnreachable { .. } => Disposition::Banner,
            RoomlinkError::Serialization(_)
            | RoomlinkError::Encoding(_)
            | RoomlinkError::Io(_)
            | RoomlinkError::InvalidMessage { .. }
            | RoomlinkError::RoomFull { .. }
            | RoomlinkError::Channel { .. } => Disposition::StatusChange,
            RoomlinkError::StateTransition(_) | RoomlinkError::Configuration { .. } => {
                Disposition::Fatal
            }
        }
    }

    /// Whether the end user should ever see this error directly
    pub fn is_user_visible(&self) -> bool {
        matches!(self.disposition(), Disposition::Banner | Disposition::Fatal)
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, RoomlinkError>;
pub type RoomlinkResult<T> = Result<T>;
