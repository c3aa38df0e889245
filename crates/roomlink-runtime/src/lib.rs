//! Roomlink Runtime
//!
//! Tokio side of Roomlink:
//! - `RoomCoordinator`, `HealthMonitor` and `CoordinatorServer`: the room
//!   coordinator and its WebSocket front end
//! - Relayed connectors (`WebSocketRelay`, in-process `LocalRelay`) and direct
//!   transports (`TcpDirectTransport`, in-memory `MemoryNetwork`)
//! - `MeshUpgradeManager`, `HybridRouter` and `MessageBridge`
//! - `ClientBuilder` / `ClientHandle`: the per-client task tying it together
//!
//! The domain rules live in `roomlink-core`; this crate wires them to
//! sockets, timers and channels.

pub mod bridge;
pub mod client;
pub mod coordinator;
pub mod direct;
pub mod events;
pub mod health;
pub mod history;
pub mod mesh;
pub mod relay;
pub mod router;
pub mod server;

pub use bridge::{BridgeHandled, BridgeOutcome, MessageBridge};
pub use client::{ClientBuilder, ClientHandle};
pub use coordinator::{ConnectionActivity, ParticipantSnapshot, RoomCoordinator, RoomSnapshot};
pub use direct::{
    DirectLink, DirectTransport, IncomingLinks, LinkConditions, MemoryNetwork, MemoryTransport,
    TcpDirectTransport,
};
pub use events::{AppEvent, AppEventReceiver, AppEventSender, ClientCommand, HealthSnapshot};
pub use health::{HealthMonitor, HealthSweep};
pub use history::{HistorySink, MemoryHistory};
pub use mesh::{LinkSnapshot, MeshEvent, MeshSettings, MeshUpgradeManager, QualityChange};
pub use relay::{LocalRelay, RelayConnection, RelayConnector, RelayHandle, WebSocketRelay};
pub use router::{Dispatch, FlushReport, HybridRouter, Received, Recipient};
pub use server::CoordinatorServer;

// Re-export core types for convenience
pub use roomlink_core::{
    ChatMessage, HealthSignal, InboundPath, MessageId, PeerId, PeerInfo, Priority, RoomId,
    RoomlinkConfig, RoomlinkError, RoomlinkResult, Route, RouteReport, TimeSource, Timestamp,
};
