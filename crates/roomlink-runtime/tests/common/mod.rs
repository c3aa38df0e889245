//! Shared fixtures for end-to-end client tests
//!
//! Every client gets its own [`LocalRelay`] onto one in-process coordinator
//! (so outages and latency can be injected per client) and an endpoint on a
//! shared [`MemoryNetwork`] for direct links.

#![allow(dead_code)]

use roomlink_core::{
    CoordinatorConfig, PeerId, RelayHealth, RoomId, RoomlinkConfig, SystemTimeSource, TimeSource,
};
use roomlink_runtime::{
    AppEvent, AppEventReceiver, ClientBuilder, ClientHandle, HealthSnapshot, LocalRelay,
    MemoryNetwork, RoomCoordinator,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn create_test_peer_id(id: u8) -> PeerId {
    PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
}

pub fn lobby() -> RoomId {
    RoomId::new("lobby").expect("valid room id")
}

pub struct TestClient {
    pub peer_id: PeerId,
    pub handle: ClientHandle,
    pub events: AppEventReceiver,
    pub relay: LocalRelay,
}

impl TestClient {
    pub async fn snapshot(&self) -> HealthSnapshot {
        self.handle
            .health_snapshot()
            .await
            .expect("client task running")
    }

    /// Wait until the relayed channel is up, then join
    pub async fn join(&self, display_name: &str) -> Vec<roomlink_core::PeerInfo> {
        wait_until(|| async move { self.snapshot().await.relay != RelayHealth::Down }).await;
        self.handle
            .join(lobby(), display_name)
            .await
            .expect("join succeeds")
    }

    /// Next event matching `predicate`, skipping everything else
    pub async fn expect_event<F>(&mut self, mut predicate: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) if predicate(&event) => return event,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event channel closed"),
                Err(_) => panic!("timed out waiting for event on {}", self.peer_id.short()),
            }
        }
    }

    pub async fn wait_for_relay(&self, health: RelayHealth) {
        wait_until(|| async move { self.snapshot().await.relay == health }).await;
    }

    pub async fn wait_until_roomless(&self) {
        wait_until(|| async move { self.snapshot().await.room_id.is_none() }).await;
    }

    /// Wait for a direct link to `peer` to be open or degraded
    pub async fn wait_for_link(&self, peer: PeerId) {
        wait_until(|| async move {
            self.snapshot()
                .await
                .links
                .iter()
                .any(|link| link.peer_id == peer && link.state.is_established())
        })
        .await;
    }
}

/// Poll `condition` every 20ms until it holds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !condition().await {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(20)).await;
    }
}

pub struct World {
    pub coordinator: Arc<RoomCoordinator>,
    pub network: MemoryNetwork,
}

impl World {
    pub fn new() -> Self {
        Self {
            coordinator: Arc::new(RoomCoordinator::new(
                CoordinatorConfig::default(),
                Arc::new(SystemTimeSource::new()),
            )),
            network: MemoryNetwork::new(),
        }
    }

    pub fn client(&self, id: u8) -> TestClient {
        self.client_with(id, RoomlinkConfig::testing(), Arc::new(SystemTimeSource::new()))
    }

    pub fn client_with(&self, id: u8, config: RoomlinkConfig, clock: Arc<dyn TimeSource>) -> TestClient {
        let peer_id = create_test_peer_id(id);
        let relay = LocalRelay::new(self.coordinator.clone());
        let (transport, incoming) = self.network.transport(peer_id);
        let (handle, events) = ClientBuilder::new(peer_id)
            .with_config(config)
            .with_clock(clock)
            .with_relay(Arc::new(relay.clone()))
            .with_transport(Arc::new(transport), incoming)
            .spawn()
            .expect("client spawns");
        TestClient {
            peer_id,
            handle,
            events,
            relay,
        }
    }
}
