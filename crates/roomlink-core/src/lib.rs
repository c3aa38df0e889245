//! Roomlink Core
//!
//! Runtime-agnostic domain model for Roomlink, a hybrid room messaging core
//! that keeps one relayed connection to a room coordinator, opportunistically
//! upgrades pairs of participants to direct links, and routes every message
//! over whichever path is healthiest (falling back to multi-hop bridging
//! through a third participant when both primary paths are degraded).
//!
//! Everything in this crate is synchronous and takes time explicitly; the
//! tokio runtime lives in `roomlink-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod bridge;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod errors;
pub mod link;
pub mod message;
pub mod presence;
pub mod protocol;
pub mod quality;
pub mod queue;
pub mod resilience;
pub mod routing;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use bridge::{BridgeCandidate, BridgeEnvelope, BridgeSelector, BridgeStep, NackReason};
pub use config::{
    BackoffPolicy, BridgeConfig, CircuitBreakerConfig, CoordinatorConfig, DiscoveryConfig,
    HealthMonitorConfig, MeshConfig, QualityConfig, QueueConfig, ResilienceConfig,
    RoomlinkConfig, RouterConfig, SessionContinuityConfig,
};
pub use dedup::{DedupWindow, RoomDedup};
pub use discovery::{Candidate, CandidateSource, PeerDiscovery};
pub use errors::{Disposition, Result, RoomlinkError, RoomlinkResult};
pub use link::{
    Connection, CrossingDecision, DirectLinkState, LinkKey, LinkRole, LinkTable, Reservation,
    StateTransitionError,
};
pub use message::{ChatMessage, Fingerprint, Priority};
pub use presence::{LinkReport, PresenceRecord, PresenceRegistry};
pub use protocol::{PeerFrame, PeerInfo, SignalingMessage};
pub use quality::{LinkQuality, NetworkCondition, QualityTier, QualityVerdict};
pub use queue::{DropReason, OutboundQueue, QueuedMessage};
pub use resilience::{
    BreakerState, CircuitBreaker, HealthInputs, HealthSignal, RelayMonitor, Resume,
    SessionContinuity,
};
pub use routing::{
    DirectPath, InboundPath, RelayHealth, Route, RoutePolicy, RouteReport, RoutingStats,
};
pub use types::{
    ConnectionId, ManualTimeSource, MessageId, PeerId, RoomId, SystemTimeSource, TimeSource,
    Timestamp,
};
