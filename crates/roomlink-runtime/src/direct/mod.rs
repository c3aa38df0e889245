//! Direct peer-to-peer transports
//!
//! A direct link is a pair of unbounded [`PeerFrame`] channels. Dialing
//! produces one end; the remote's transport yields the other end on its
//! incoming stream, already tagged with the dialer's PeerId from the
//! opening `hello` frame. Dropping the outbound sender closes the link.

use async_trait::async_trait;
use roomlink_core::{PeerFrame, PeerId, RoomId, RoomlinkResult};
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

pub use memory::{LinkConditions, MemoryNetwork, MemoryTransport};
pub use tcp::TcpDirectTransport;

/// One end of an open direct link
#[derive(Debug)]
pub struct DirectLink {
    pub remote: PeerId,
    pub outbound: mpsc::UnboundedSender<PeerFrame>,
    pub inbound: mpsc::UnboundedReceiver<PeerFrame>,
}

/// Links dialed to us by other peers
pub type IncomingLinks = mpsc::UnboundedReceiver<DirectLink>;

/// Peer-to-peer transport used for upgraded links
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Address other peers dial to reach us
    fn address(&self) -> String;

    /// Open a link to `remote` listening at `address`
    async fn dial(
        &self,
        local: PeerId,
        room_id: &RoomId,
        address: &str,
        remote: PeerId,
    ) -> RoomlinkResult<DirectLink>;
}
