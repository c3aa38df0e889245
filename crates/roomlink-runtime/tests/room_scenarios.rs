//! End-to-end room scenarios
//!
//! Clients run their full task loop against an in-process coordinator and an
//! in-memory direct network, on real tokio time with the `testing` timers.

mod common;

use common::{create_test_peer_id, lobby, World};
use roomlink_core::{
    HealthSignal, InboundPath, ManualTimeSource, PeerInfo, RelayHealth, Route, RoomlinkConfig,
};
use roomlink_runtime::{AppEvent, LinkConditions};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn blocked() -> LinkConditions {
    LinkConditions {
        latency: Duration::ZERO,
        blocked: true,
    }
}

// ----------------------------------------------------------------------------
// Membership
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_second_joiner_sees_first_and_first_is_notified() {
    let world = World::new();
    let mut a = world.client(1);
    let b = world.client(2);

    let roster = a.join("alice").await;
    assert!(roster.is_empty());

    let roster = b.join("bob").await;
    assert_eq!(
        roster,
        vec![PeerInfo {
            peer_id: a.peer_id,
            display_name: "alice".into(),
        }]
    );

    let event = a
        .expect_event(|event| matches!(event, AppEvent::PeerJoined { .. }))
        .await;
    assert_eq!(
        event,
        AppEvent::PeerJoined {
            peer_id: b.peer_id,
            display_name: "bob".into(),
        }
    );

    let room = world.coordinator.room(&lobby()).expect("room exists");
    assert_eq!(room.participants.len(), 2);
}

#[tokio::test]
async fn test_leave_notifies_remaining_participant() {
    let world = World::new();
    let mut a = world.client(1);
    let b = world.client(2);
    a.join("alice").await;
    b.join("bob").await;

    b.handle.leave().expect("leave accepted");
    let event = a
        .expect_event(|event| matches!(event, AppEvent::PeerLeft { .. }))
        .await;
    match event {
        AppEvent::PeerLeft {
            peer_id, reason, ..
        } => {
            assert_eq!(peer_id, b.peer_id);
            assert_eq!(reason, "left");
        }
        other => panic!("unexpected {other:?}"),
    }
    b.wait_until_roomless().await;
}

// ----------------------------------------------------------------------------
// Relayed delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_message_without_direct_link_goes_over_relay_and_is_confirmed() {
    let world = World::new();
    let mut a = world.client(1);
    let mut b = world.client(2);
    world.network.set_conditions(a.peer_id, b.peer_id, blocked());
    a.join("alice").await;
    b.join("bob").await;

    let report = a.handle.send("hello").await.expect("send accepted");
    assert_eq!(report.route_for(b.peer_id), Some(Route::Relayed));
    assert!(report.relayed_broadcast);

    let received = b
        .expect_event(|event| matches!(event, AppEvent::MessageReceived { .. }))
        .await;
    match received {
        AppEvent::MessageReceived { message, path } => {
            assert_eq!(message.content, "hello");
            assert_eq!(message.sender, a.peer_id);
            assert_eq!(message.display_name, "alice");
            assert_eq!(path, InboundPath::Relayed);
            assert!(message.delivered_at.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }

    let message_id = report.message_id;
    a.expect_event(|event| {
        matches!(event, AppEvent::MessageDelivered { message_id: id, .. } if *id == message_id)
    })
    .await;
}

#[tokio::test]
async fn test_send_outside_a_room_is_rejected() {
    let world = World::new();
    let a = world.client(1);
    assert!(a.handle.send("hello").await.is_err());

    a.join("alice").await;
    assert!(a.handle.send("   ").await.is_err());
}

// ----------------------------------------------------------------------------
// Mesh upgrade
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_simultaneous_upgrades_leave_exactly_one_link() {
    let world = World::new();
    let a = world.client(1);
    let b = world.client(2);
    a.join("alice").await;
    b.join("bob").await;

    let _ = tokio::join!(a.handle.upgrade(b.peer_id), b.handle.upgrade(a.peer_id));
    a.wait_for_link(b.peer_id).await;
    b.wait_for_link(a.peer_id).await;

    // Let any losing handshake finish before counting
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(world.network.live_links(a.peer_id, b.peer_id), 1);

    let links = a.snapshot().await.links;
    assert_eq!(
        links
            .iter()
            .filter(|link| link.peer_id == b.peer_id && link.state.is_established())
            .count(),
        1
    );
}

#[tokio::test]
async fn test_messages_use_direct_link_once_open() {
    let world = World::new();
    let a = world.client(1);
    let mut b = world.client(2);
    a.join("alice").await;
    b.join("bob").await;
    a.wait_for_link(b.peer_id).await;

    let report = a.handle.send("over the mesh").await.expect("send accepted");
    assert_eq!(report.route_for(b.peer_id), Some(Route::Direct));
    assert!(!report.relayed_broadcast);

    let received = b
        .expect_event(|event| matches!(event, AppEvent::MessageReceived { .. }))
        .await;
    assert!(matches!(
        received,
        AppEvent::MessageReceived {
            path: InboundPath::Direct,
            ..
        }
    ));
}

#[tokio::test]
async fn test_critical_direct_link_with_healthy_relay_routes_relayed() {
    let world = World::new();
    let mut a = world.client(1);
    let b = world.client(2);
    a.join("alice").await;
    b.join("bob").await;
    a.wait_for_link(b.peer_id).await;

    world.network.set_conditions(a.peer_id, b.peer_id, blocked());
    let peer = b.peer_id;
    a.expect_event(|event| {
        matches!(event, AppEvent::ConnectionQualityChanged { peer_id, degraded: true, .. } if *peer_id == peer)
    })
    .await;
    assert_eq!(a.snapshot().await.relay, RelayHealth::Healthy);

    let report = a.handle.send("still there?").await.expect("send accepted");
    assert_eq!(report.route_for(b.peer_id), Some(Route::Relayed));
    assert_eq!(report.count(Route::Bridge), 0);
}

#[tokio::test]
async fn test_peer_unreachable_at_first_is_linked_once_path_clears() {
    let world = World::new();
    let a = world.client(1);
    let b = world.client(2);
    world.network.set_conditions(a.peer_id, b.peer_id, blocked());
    a.join("alice").await;
    b.join("bob").await;

    // Several attempts time out and trip the breaker
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(world.network.live_links(a.peer_id, b.peer_id), 0);

    world
        .network
        .set_conditions(a.peer_id, b.peer_id, LinkConditions::default());
    a.wait_for_link(b.peer_id).await;
    b.wait_for_link(a.peer_id).await;
}

#[tokio::test]
async fn test_upgrade_to_absent_peer_fails_fast() {
    let world = World::new();
    let a = world.client(1);
    a.join("alice").await;

    let started = Instant::now();
    let linked = a
        .handle
        .upgrade(create_test_peer_id(9))
        .await
        .expect("client task running");
    assert!(!linked);
    assert!(started.elapsed() < Duration::from_millis(400));
}

// ----------------------------------------------------------------------------
// Session continuity
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_short_outage_rejoins_with_original_name() {
    let world = World::new();
    let clock = Arc::new(ManualTimeSource::new());
    let mut a = world.client_with(1, RoomlinkConfig::testing(), clock.clone());
    let mut b = world.client(2);
    world.network.set_conditions(a.peer_id, b.peer_id, blocked());
    a.join("alice").await;
    b.join("bob").await;
    a.expect_event(|event| matches!(event, AppEvent::Joined { .. }))
        .await;

    a.relay.set_available(false);
    a.relay.sever();
    a.expect_event(|event| {
        matches!(
            event,
            AppEvent::HealthChanged {
                signal: HealthSignal::Reconnecting
            }
        )
    })
    .await;
    b.expect_event(|event| matches!(event, AppEvent::PeerLeft { .. }))
        .await;

    clock.advance(Duration::from_secs(90));
    a.relay.set_available(true);

    a.expect_event(|event| matches!(event, AppEvent::Joined { .. }))
        .await;
    let participant = world
        .coordinator
        .participant(a.peer_id)
        .expect("rejoined");
    assert_eq!(participant.display_name, "alice");

    let event = b
        .expect_event(|event| matches!(event, AppEvent::PeerJoined { .. }))
        .await;
    assert_eq!(
        event,
        AppEvent::PeerJoined {
            peer_id: a.peer_id,
            display_name: "alice".into(),
        }
    );
}

#[tokio::test]
async fn test_long_outage_asks_before_rejoining() {
    let world = World::new();
    let clock = Arc::new(ManualTimeSource::new());
    let mut a = world.client_with(1, RoomlinkConfig::testing(), clock.clone());
    a.join("alice").await;

    a.relay.set_available(false);
    a.relay.sever();
    a.wait_for_relay(RelayHealth::Down).await;

    clock.advance(Duration::from_secs(301));
    a.relay.set_available(true);

    let event = a
        .expect_event(|event| matches!(event, AppEvent::RejoinConfirmationRequired { .. }))
        .await;
    match event {
        AppEvent::RejoinConfirmationRequired {
            room_id,
            display_name,
            gap,
        } => {
            assert_eq!(room_id, lobby());
            assert_eq!(display_name, "alice");
            assert!(gap >= Duration::from_secs(301));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(world.coordinator.participant(a.peer_id).is_none());

    a.handle
        .confirm_rejoin(Some("alice again".into()))
        .expect("confirm accepted");
    a.expect_event(|event| matches!(event, AppEvent::Joined { .. }))
        .await;
    let participant = world
        .coordinator
        .participant(a.peer_id)
        .expect("rejoined");
    assert_eq!(participant.display_name, "alice again");
}

#[tokio::test]
async fn test_unreachable_coordinator_is_reported_once() {
    let world = World::new();
    let clock = Arc::new(ManualTimeSource::new());
    let mut a = world.client_with(1, RoomlinkConfig::testing(), clock.clone());
    a.join("alice").await;

    a.relay.set_available(false);
    a.relay.sever();

    // Breaker cooldowns are measured on the manual clock
    let ticker = {
        let clock = clock.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                clock.advance(Duration::from_millis(100));
            }
        })
    };
    let event = a
        .expect_event(|event| matches!(event, AppEvent::CoordinatorUnreachable { .. }))
        .await;
    ticker.abort();
    assert!(matches!(event, AppEvent::CoordinatorUnreachable { attempts } if attempts >= 4));
    assert_eq!(a.snapshot().await.signal, HealthSignal::Offline);
}
