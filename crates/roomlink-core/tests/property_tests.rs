//! Property-based tests for the core connection invariants
//!
//! These tests exercise the link table check-and-set, dedup windows,
//! backoff growth and discovery caps over arbitrary inputs.

use core::time::Duration;
use proptest::prelude::*;
use roomlink_core::{
    config::{BackoffPolicy, DiscoveryConfig},
    protocol::PeerInfo,
    BridgeConfig, BridgeEnvelope, BridgeStep, ChatMessage, DedupWindow, LinkRole, LinkTable,
    ManualTimeSource, PeerDiscovery, PeerId, PresenceRecord, Reservation, RoomId, TimeSource, Timestamp,
};
use std::sync::Arc;

/// Generate arbitrary PeerId for property tests
fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 8]>().prop_map(PeerId::new)
}

/// Operations applied to a link table in random order
#[derive(Debug, Clone)]
enum TableOp {
    Reserve(u8, bool),
    Open(u8),
    Fail(u8),
    Close(u8),
    Degrade(u8),
    Recover(u8),
    Cross(u8),
}

fn arb_table_op() -> impl Strategy<Value = TableOp> {
    let peer = 0u8..4;
    prop_oneof![
        (peer.clone(), any::<bool>()).prop_map(|(p, dialer)| TableOp::Reserve(p, dialer)),
        peer.clone().prop_map(TableOp::Open),
        peer.clone().prop_map(TableOp::Fail),
        peer.clone().prop_map(TableOp::Close),
        peer.clone().prop_map(TableOp::Degrade),
        peer.clone().prop_map(TableOp::Recover),
        peer.prop_map(TableOp::Cross),
    ]
}

fn room() -> RoomId {
    RoomId::new("lobby").unwrap()
}

proptest! {
    /// Property: a successful reservation is only granted when the pair is
    /// free, so two live attempts to the same peer can never coexist
    #[test]
    fn reservation_never_doubles_a_live_link(ops in prop::collection::vec(arb_table_op(), 1..64)) {
        let local = PeerId::new([9; 8]);
        let mut table = LinkTable::new(local);
        let now = Timestamp::new(1_000);

        for op in ops {
            match op {
                TableOp::Reserve(p, dialer) => {
                    let target = PeerId::new([p; 8]);
                    let was_live = table.is_live(target);
                    let role = if dialer { LinkRole::Dialer } else { LinkRole::Responder };
                    let reservation = table.reserve(target, role, now);
                    prop_assert_eq!(reservation == Reservation::Proceed, !was_live);
                }
                TableOp::Open(p) => { let _ = table.mark_open(PeerId::new([p; 8]), now); }
                TableOp::Fail(p) => { let _ = table.mark_failed(PeerId::new([p; 8]), "timeout", now); }
                TableOp::Close(p) => { let _ = table.mark_closed(PeerId::new([p; 8]), "closed", now); }
                TableOp::Degrade(p) => { let _ = table.set_degraded(PeerId::new([p; 8]), now); }
                TableOp::Recover(p) => { let _ = table.set_recovered(PeerId::new([p; 8]), now); }
                TableOp::Cross(p) => { let _ = table.resolve_crossing(PeerId::new([p; 8])); }
            }
            prop_assert!(table.live_peers().len() <= 4);
            prop_assert_eq!(
                table.pending_count() + table.established_count(),
                table.live_peers().len()
            );
        }
    }

    /// Property: crossing requests resolve to exactly one dialer
    #[test]
    fn crossing_requests_elect_one_dialer(a in arb_peer_id(), b in arb_peer_id()) {
        prop_assume!(a != b);
        let now = Timestamp::new(0);
        let mut table_a = LinkTable::new(a);
        let mut table_b = LinkTable::new(b);
        table_a.reserve(b, LinkRole::Dialer, now);
        table_b.reserve(a, LinkRole::Dialer, now);

        let decision_a = table_a.resolve_crossing(b);
        let decision_b = table_b.resolve_crossing(a);
        let dialers = [decision_a, decision_b]
            .iter()
            .filter(|d| **d == Some(roomlink_core::CrossingDecision::KeepDialing))
            .count();
        prop_assert_eq!(dialers, 1);
    }

    /// Property: any sequence of fingerprints passes the window at most once
    /// while it stays inside the window
    #[test]
    fn dedup_delivers_each_fingerprint_once(
        senders in prop::collection::vec(0u8..8, 1..200),
        repeats in 1usize..4,
    ) {
        let mut window = DedupWindow::new(512);
        let messages: Vec<ChatMessage> = senders
            .iter()
            .map(|s| ChatMessage::new(room(), PeerId::new([*s; 8]), "p", "x", Timestamp::new(0)))
            .collect();

        let mut delivered = 0usize;
        for _ in 0..repeats {
            for message in &messages {
                if window.insert(message.fingerprint()) {
                    delivered += 1;
                }
            }
        }
        prop_assert_eq!(delivered, messages.len());
    }

    /// Property: backoff delays never decrease and never exceed the cap
    #[test]
    fn backoff_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        multiplier in 1.0f64..4.0,
        cap_ms in 1u64..120_000,
    ) {
        prop_assume!(base_ms <= cap_ms);
        let policy = BackoffPolicy {
            base: Duration::from_millis(base_ms),
            multiplier,
            cap: Duration::from_millis(cap_ms),
            max_attempts: 32,
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..32 {
            let delay = policy.delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= policy.cap);
            previous = delay;
        }
    }

    /// Property: discovery output is capped, excludes self and never
    /// contains duplicates
    #[test]
    fn discovery_is_capped_and_unique(
        roster in prop::collection::vec(0u8..16, 0..12),
        presence in prop::collection::vec((0u8..16, 0u8..=100), 0..12),
    ) {
        let clock = ManualTimeSource::new();
        let local = PeerId::new([0; 8]);
        let mut discovery = PeerDiscovery::new(local, DiscoveryConfig::default(), Arc::new(clock.clone()));

        let infos: Vec<PeerInfo> = roster
            .iter()
            .map(|p| PeerInfo { peer_id: PeerId::new([*p; 8]), display_name: format!("p{p}") })
            .collect();
        discovery.update_roster(&room(), &infos);
        for (p, quality) in &presence {
            discovery.observe_presence(PresenceRecord::new(PeerId::new([*p; 8]), room(), clock.now(), *quality));
        }

        let candidates = discovery.discover(&room(), &[]);
        prop_assert!(candidates.len() <= 3);
        prop_assert!(candidates.iter().all(|c| c.peer_id != local));
        let mut ids: Vec<PeerId> = candidates.iter().map(|c| c.peer_id).collect();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), candidates.len());
        for pair in candidates.windows(2) {
            prop_assert!(pair[0].quality >= pair[1].quality);
        }
    }

    /// Property: no chain of forwarding nodes pushes an envelope past the cap
    #[test]
    fn bridge_hops_never_exceed_cap(hop_cap in 1u8..5, chain in prop::collection::vec(10u8..40, 1..8)) {
        let config = BridgeConfig { hop_cap, ..BridgeConfig::default() };
        let origin = PeerId::new([1; 8]);
        let recipient = PeerId::new([2; 8]);
        let message = ChatMessage::new(room(), origin, "o", "m", Timestamp::new(0));
        let mut envelope = BridgeEnvelope::new(message, origin, recipient);

        for node in chain {
            match roomlink_core::bridge::next_step(&envelope, PeerId::new([node; 8]), &config, false, true) {
                BridgeStep::ForwardRelayed(next) | BridgeStep::ForwardDirect(next) => {
                    prop_assert!(next.hop_count <= hop_cap);
                    envelope = next;
                }
                BridgeStep::Reject(_) => break,
                BridgeStep::Deliver => unreachable!(),
            }
        }
        prop_assert!(envelope.hop_count <= hop_cap.max(1));
    }
}
