//! In-memory direct transport
//!
//! Every endpoint registers on a shared [`MemoryNetwork`] under a
//! `mem://` address. Per-pair [`LinkConditions`] add latency or black-hole
//! traffic, and the network counts live links per pair so tests can check
//! that a pair never holds two at once.

use async_trait::async_trait;
use roomlink_core::{LinkKey, PeerFrame, PeerId, RoomId, RoomlinkError, RoomlinkResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{DirectLink, DirectTransport, IncomingLinks};

/// Simulated path characteristics between two peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkConditions {
    /// One-way delay added to every frame
    pub latency: Duration,
    /// Dials hang and frames vanish
    pub blocked: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<String, (PeerId, mpsc::UnboundedSender<DirectLink>)>,
    conditions: HashMap<LinkKey, LinkConditions>,
    live: HashMap<LinkKey, usize>,
    opened: HashMap<LinkKey, usize>,
}

/// Shared switchboard for in-memory transports
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an endpoint for `peer_id`
    pub fn transport(&self, peer_id: PeerId) -> (MemoryTransport, IncomingLinks) {
        let address = format!("mem://{}", peer_id);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        self.state()
            .endpoints
            .insert(address.clone(), (peer_id, incoming_tx));
        (
            MemoryTransport {
                network: self.clone(),
                address,
            },
            incoming_rx,
        )
    }

    pub fn set_conditions(&self, a: PeerId, b: PeerId, conditions: LinkConditions) {
        self.state().conditions.insert(LinkKey::new(a, b), conditions);
    }

    pub fn conditions(&self, a: PeerId, b: PeerId) -> LinkConditions {
        self.state()
            .conditions
            .get(&LinkKey::new(a, b))
            .copied()
            .unwrap_or_default()
    }

    /// Links between `a` and `b` that neither side has closed
    pub fn live_links(&self, a: PeerId, b: PeerId) -> usize {
        self.state()
            .live
            .get(&LinkKey::new(a, b))
            .copied()
            .unwrap_or(0)
    }

    /// Links ever opened between `a` and `b`
    pub fn opened_links(&self, a: PeerId, b: PeerId) -> usize {
        self.state()
            .opened
            .get(&LinkKey::new(a, b))
            .copied()
            .unwrap_or(0)
    }

    fn link_closed(&self, key: LinkKey) {
        let mut state = self.state();
        if let Some(count) = state.live.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Endpoint on a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
}

/// Carry frames one way, honoring the pair's current conditions
fn spawn_pipe(
    network: MemoryNetwork,
    key: LinkKey,
    closed: Arc<AtomicBool>,
    mut from: mpsc::UnboundedReceiver<PeerFrame>,
    to: mpsc::UnboundedSender<PeerFrame>,
) {
    tokio::spawn(async move {
        while let Some(frame) = from.recv().await {
            let conditions = network.conditions(key.low(), key.high());
            if conditions.blocked {
                continue;
            }
            if !conditions.latency.is_zero() {
                tokio::time::sleep_until(Instant::now() + conditions.latency).await;
            }
            if to.send(frame).is_err() {
                break;
            }
        }
        if !closed.swap(true, Ordering::SeqCst) {
            network.link_closed(key);
            debug!("Memory link {} closed", key);
        }
    });
}

#[async_trait]
impl DirectTransport for MemoryTransport {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn dial(
        &self,
        local: PeerId,
        room_id: &RoomId,
        address: &str,
        remote: PeerId,
    ) -> RoomlinkResult<DirectLink> {
        let key = LinkKey::new(local, remote);
        let endpoint = self
            .network
            .state()
            .endpoints
            .get(address)
            .map(|(peer, incoming)| (*peer, incoming.clone()));
        let Some((listener, incoming)) = endpoint else {
            return Err(RoomlinkError::peer_unavailable(remote));
        };
        if listener != remote {
            return Err(RoomlinkError::invalid_message(format!(
                "{address} belongs to {listener}, not {remote}"
            )));
        }

        let conditions = self.network.conditions(local, remote);
        if conditions.blocked {
            // Unreachable peers never answer; the caller's timeout decides
            futures::future::pending::<()>().await;
        }
        if !conditions.latency.is_zero() {
            tokio::time::sleep(conditions.latency * 2).await;
        }

        let (local_out, local_pipe_in) = mpsc::unbounded_channel();
        let (remote_pipe_out, local_in) = mpsc::unbounded_channel();
        let (remote_out, remote_pipe_in) = mpsc::unbounded_channel();
        let (local_pipe_out, remote_in) = mpsc::unbounded_channel();

        let closed = Arc::new(AtomicBool::new(false));
        spawn_pipe(self.network.clone(), key, closed.clone(), local_pipe_in, local_pipe_out);
        spawn_pipe(self.network.clone(), key, closed, remote_pipe_in, remote_pipe_out);

        {
            let mut state = self.network.state();
            *state.live.entry(key).or_insert(0) += 1;
            *state.opened.entry(key).or_insert(0) += 1;
        }

        let _ = local_out.send(PeerFrame::Hello {
            peer_id: local,
            room_id: room_id.clone(),
        });
        incoming
            .send(DirectLink {
                remote: local,
                outbound: remote_out,
                inbound: remote_in,
            })
            .map_err(|_| RoomlinkError::peer_unavailable(remote))?;

        debug!("Memory link {} opened by {}", key, local.short());
        Ok(DirectLink {
            remote,
            outbound: local_out,
            inbound: local_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn create_test_peer_id(id: u8) -> PeerId {
        PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
    }

    #[tokio::test]
    async fn test_dial_delivers_hello_and_counts_links() {
        let network = MemoryNetwork::new();
        let a = create_test_peer_id(1);
        let b = create_test_peer_id(2);
        let (transport_a, _incoming_a) = network.transport(a);
        let (transport_b, mut incoming_b) = network.transport(b);
        let room = RoomId::new("lobby").unwrap();

        let link = transport_a
            .dial(a, &room, &transport_b.address(), b)
            .await
            .unwrap();
        let mut accepted = incoming_b.recv().await.unwrap();
        assert_eq!(accepted.remote, a);
        assert!(matches!(
            accepted.inbound.recv().await,
            Some(PeerFrame::Hello { peer_id, .. }) if peer_id == a
        ));
        assert_eq!(network.live_links(a, b), 1);

        drop(link);
        assert!(timeout(Duration::from_secs(1), accepted.inbound.recv())
            .await
            .unwrap()
            .is_none());
        tokio::task::yield_now().await;
        assert_eq!(network.live_links(b, a), 0);
        assert_eq!(network.opened_links(a, b), 1);
    }

    #[tokio::test]
    async fn test_blocked_pair_never_connects() {
        let network = MemoryNetwork::new();
        let a = create_test_peer_id(1);
        let b = create_test_peer_id(2);
        let (transport_a, _incoming_a) = network.transport(a);
        let (transport_b, _incoming_b) = network.transport(b);
        network.set_conditions(
            a,
            b,
            LinkConditions {
                blocked: true,
                ..LinkConditions::default()
            },
        );
        let room = RoomId::new("lobby").unwrap();
        let attempt = timeout(
            Duration::from_millis(100),
            transport_a.dial(a, &room, &transport_b.address(), b),
        )
        .await;
        assert!(attempt.is_err());
    }
}
