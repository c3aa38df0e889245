//! Direct Link State Machine
//!
//! Tracks the lifecycle of every direct link a client holds or is trying to
//! open. The [`LinkTable`] is the only structure mutated by both the outgoing
//! upgrade path and the incoming offer path, so every mutation goes through
//! its check-and-set operations; that is what keeps at most one non-closed
//! direct link alive per pair of peers.

use core::fmt;
use core::time::Duration;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ConnectionId, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Connection Variants
// ----------------------------------------------------------------------------

/// Either connection kind a client can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Connection {
    /// Always-on channel through the coordinator
    Relayed {
        connection_id: Option<ConnectionId>,
        connected_since: Option<Timestamp>,
    },
    /// Peer-to-peer link to one participant
    Direct { peer_id: PeerId, state: DirectLinkState },
}

/// Unordered pair of peers identifying one direct link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    low: PeerId,
    high: PeerId,
}

impl LinkKey {
    pub fn new(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> PeerId {
        self.low
    }

    pub fn high(&self) -> PeerId {
        self.high
    }

    /// The other end of the link, if `peer_id` is one of its ends
    pub fn other(&self, peer_id: PeerId) -> Option<PeerId> {
        if peer_id == self.low {
            Some(self.high)
        } else if peer_id == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low.short(), self.high.short())
    }
}

/// Which side of the handshake this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkRole {
    /// Sent `request-connection` and dials the remote address
    Dialer,
    /// Accepted a request and waits for the incoming link
    Responder,
}

// ----------------------------------------------------------------------------
// Link States
// ----------------------------------------------------------------------------

/// Lifecycle of one direct link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectLinkState {
    /// No link and no attempt in flight
    Idle,
    /// Attempt in flight
    Pending { role: LinkRole, started_at: Timestamp },
    /// Usable link
    Open { role: LinkRole, opened_at: Timestamp },
    /// Still open but below the quality threshold; routers avoid it
    Degraded {
        role: LinkRole,
        opened_at: Timestamp,
        degraded_at: Timestamp,
    },
    /// Attempt that never opened
    Failed { at: Timestamp, reason: String },
    /// Link that was torn down
    Closed {
        at: Timestamp,
        reason: String,
        opened_at: Option<Timestamp>,
    },
}

/// Events that drive [`DirectLinkState`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Initiate { role: LinkRole },
    Established,
    AttemptFailed { reason: String },
    QualityDropped,
    QualityRecovered,
    Close { reason: String },
}

impl LinkEvent {
    fn name(&self) -> &'static str {
        match self {
            LinkEvent::Initiate { .. } => "Initiate",
            LinkEvent::Established => "Established",
            LinkEvent::AttemptFailed { .. } => "AttemptFailed",
            LinkEvent::QualityDropped => "QualityDropped",
            LinkEvent::QualityRecovered => "QualityRecovered",
            LinkEvent::Close { .. } => "Close",
        }
    }
}

impl DirectLinkState {
    /// Get current state name for logging
    pub fn state_name(&self) -> &'static str {
        match self {
            DirectLinkState::Idle => "Idle",
            DirectLinkState::Pending { .. } => "Pending",
            DirectLinkState::Open { .. } => "Open",
            DirectLinkState::Degraded { .. } => "Degraded",
            DirectLinkState::Failed { .. } => "Failed",
            DirectLinkState::Closed { .. } => "Closed",
        }
    }

    /// Pending, open and degraded links all occupy the pair
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DirectLinkState::Pending { .. }
                | DirectLinkState::Open { .. }
                | DirectLinkState::Degraded { .. }
        )
    }

    /// Only an open, non-degraded link carries routed traffic
    pub fn is_usable(&self) -> bool {
        matches!(self, DirectLinkState::Open { .. })
    }

    /// Whether the link has an established transport underneath
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            DirectLinkState::Open { .. } | DirectLinkState::Degraded { .. }
        )
    }

    pub fn role(&self) -> Option<LinkRole> {
        match self {
            DirectLinkState::Pending { role, .. }
            | DirectLinkState::Open { role, .. }
            | DirectLinkState::Degraded { role, .. } => Some(*role),
            _ => None,
        }
    }

    pub fn opened_at(&self) -> Option<Timestamp> {
        match self {
            DirectLinkState::Open { opened_at, .. }
            | DirectLinkState::Degraded { opened_at, .. } => Some(*opened_at),
            DirectLinkState::Closed { opened_at, .. } => *opened_at,
            _ => None,
        }
    }

    /// Process an event and transition to the next state (consumes self)
    pub fn transition(
        self,
        event: LinkEvent,
        now: Timestamp,
    ) -> Result<DirectLinkState, StateTransitionError> {
        let from_state = self.state_name();
        let event_name = event.name();

        match (self, event) {
            (
                DirectLinkState::Idle
                | DirectLinkState::Failed { .. }
                | DirectLinkState::Closed { .. },
                LinkEvent::Initiate { role },
            ) => Ok(DirectLinkState::Pending {
                role,
                started_at: now,
            }),

            (DirectLinkState::Pending { role, .. }, LinkEvent::Established) => {
                Ok(DirectLinkState::Open {
                    role,
                    opened_at: now,
                })
            }

            (DirectLinkState::Pending { .. }, LinkEvent::AttemptFailed { reason }) => {
                Ok(DirectLinkState::Failed { at: now, reason })
            }

            (DirectLinkState::Open { role, opened_at }, LinkEvent::QualityDropped) => {
                Ok(DirectLinkState::Degraded {
                    role,
                    opened_at,
                    degraded_at: now,
                })
            }

            (DirectLinkState::Degraded { role, opened_at, .. }, LinkEvent::QualityRecovered) => {
                Ok(DirectLinkState::Open { role, opened_at })
            }

            (DirectLinkState::Pending { .. }, LinkEvent::Close { reason }) => {
                Ok(DirectLinkState::Closed {
                    at: now,
                    reason,
                    opened_at: None,
                })
            }

            (
                DirectLinkState::Open { opened_at, .. }
                | DirectLinkState::Degraded { opened_at, .. },
                LinkEvent::Close { reason },
            ) => Ok(DirectLinkState::Closed {
                at: now,
                reason,
                opened_at: Some(opened_at),
            }),

            _ => Err(StateTransitionError::InvalidTransition {
                from_state: from_state.to_string(),
                event: event_name.to_string(),
                reason: "Transition not valid from current state".to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during link state transitions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateTransitionError {
    /// Invalid state transition attempted
    #[error("Invalid transition from {from_state} on event {event}: {reason}")]
    InvalidTransition {
        from_state: String,
        event: String,
        reason: String,
    },
    /// Operation on a peer the table has never seen
    #[error("No link entry for peer {peer_id}")]
    UnknownLink { peer_id: PeerId },
}

// ----------------------------------------------------------------------------
// Link Table
// ----------------------------------------------------------------------------

/// Outcome of the atomic check-and-set before dialing or accepting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Entry is now pending and owned by the caller
    Proceed,
    /// Another attempt is already in flight
    AlreadyPending(LinkRole),
    /// A link is already open (possibly degraded)
    AlreadyOpen,
}

/// What to do with a `request-connection` that crosses our own attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingDecision {
    /// We have the smaller PeerId and remain the dialer
    KeepDialing,
    /// Our entry was converted to responder; accept the remote's request
    BecomeResponder,
}

#[derive(Debug, Clone)]
struct LinkEntry {
    state: DirectLinkState,
    /// How long the most recent open period lasted
    last_open_duration: Option<Duration>,
    reconnect_attempts: u32,
}

/// Per-client table of direct links keyed by remote PeerId
#[derive(Debug, Clone)]
pub struct LinkTable {
    local: PeerId,
    entries: HashMap<PeerId, LinkEntry>,
}

impl LinkTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: HashMap::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn key_for(&self, remote: PeerId) -> LinkKey {
        LinkKey::new(self.local, remote)
    }

    /// Check-and-set: claim the pair for a new attempt unless it is already
    /// pending or open
    pub fn reserve(&mut self, target: PeerId, role: LinkRole, now: Timestamp) -> Reservation {
        let entry = self.entries.entry(target).or_insert_with(|| LinkEntry {
            state: DirectLinkState::Idle,
            last_open_duration: None,
            reconnect_attempts: 0,
        });

        match &entry.state {
            DirectLinkState::Pending { role, .. } => Reservation::AlreadyPending(*role),
            DirectLinkState::Open { .. } | DirectLinkState::Degraded { .. } => {
                Reservation::AlreadyOpen
            }
            _ => {
                let previous = core::mem::replace(&mut entry.state, DirectLinkState::Idle);
                // Idle, Failed and Closed all accept Initiate
                entry.state = previous
                    .transition(LinkEvent::Initiate { role }, now)
                    .unwrap_or(DirectLinkState::Pending {
                        role,
                        started_at: now,
                    });
                debug!("Reserved link {} as {:?}", LinkKey::new(self.local, target), role);
                Reservation::Proceed
            }
        }
    }

    /// Resolve a request from `remote` that arrives while our own attempt to
    /// it is pending: the smaller PeerId stays dialer
    pub fn resolve_crossing(&mut self, remote: PeerId) -> Option<CrossingDecision> {
        let local = self.local;
        let entry = self.entries.get_mut(&remote)?;
        match &mut entry.state {
            DirectLinkState::Pending { role, .. } => {
                if *role == LinkRole::Responder {
                    return Some(CrossingDecision::BecomeResponder);
                }
                if local < remote {
                    Some(CrossingDecision::KeepDialing)
                } else {
                    *role = LinkRole::Responder;
                    debug!("Crossing request from {}: converted to responder", remote.short());
                    Some(CrossingDecision::BecomeResponder)
                }
            }
            _ => None,
        }
    }

    fn apply(
        &mut self,
        target: PeerId,
        event: LinkEvent,
        now: Timestamp,
    ) -> Result<&mut LinkEntry, StateTransitionError> {
        let entry = self
            .entries
            .get_mut(&target)
            .ok_or(StateTransitionError::UnknownLink { peer_id: target })?;
        let next = entry.state.clone().transition(event, now)?;
        entry.state = next;
        Ok(entry)
    }

    /// Pending attempt succeeded
    pub fn mark_open(&mut self, target: PeerId, now: Timestamp) -> Result<(), StateTransitionError> {
        self.apply(target, LinkEvent::Established, now)?;
        Ok(())
    }

    /// Pending attempt gave up; releases the pair
    pub fn mark_failed<R: Into<String>>(
        &mut self,
        target: PeerId,
        reason: R,
        now: Timestamp,
    ) -> Result<(), StateTransitionError> {
        self.apply(
            target,
            LinkEvent::AttemptFailed {
                reason: reason.into(),
            },
            now,
        )?;
        Ok(())
    }

    /// Tear down a pending or established link; returns how long it was open
    pub fn mark_closed<R: Into<String>>(
        &mut self,
        target: PeerId,
        reason: R,
        now: Timestamp,
    ) -> Result<Option<Duration>, StateTransitionError> {
        let entry = self.apply(
            target,
            LinkEvent::Close {
                reason: reason.into(),
            },
            now,
        )?;
        let open_for = entry.state.opened_at().map(|opened| now - opened);
        if open_for.is_some() {
            entry.last_open_duration = open_for;
        }
        Ok(open_for)
    }

    /// Open link fell below the quality threshold
    pub fn set_degraded(&mut self, target: PeerId, now: Timestamp) -> Result<(), StateTransitionError> {
        self.apply(target, LinkEvent::QualityDropped, now)?;
        Ok(())
    }

    /// Degraded link recovered
    pub fn set_recovered(&mut self, target: PeerId, now: Timestamp) -> Result<(), StateTransitionError> {
        self.apply(target, LinkEvent::QualityRecovered, now)?;
        Ok(())
    }

    pub fn state(&self, target: PeerId) -> Option<&DirectLinkState> {
        self.entries.get(&target).map(|entry| &entry.state)
    }

    pub fn is_live(&self, target: PeerId) -> bool {
        self.state(target).is_some_and(DirectLinkState::is_live)
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state, DirectLinkState::Pending { .. }))
            .count()
    }

    /// Established links (open or degraded)
    pub fn established_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state.is_established())
            .count()
    }

    /// Peers with a usable (open, non-degraded) link
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_usable())
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Peers occupying the pair in any non-closed state
    pub fn live_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_live())
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Whether the last link to `target` stayed open long enough to deserve
    /// a reconnection attempt
    pub fn was_stable(&self, target: PeerId, min_stable: Duration) -> bool {
        self.entries
            .get(&target)
            .and_then(|entry| entry.last_open_duration)
            .is_some_and(|open_for| open_for >= min_stable)
    }

    pub fn reconnect_attempts(&self, target: PeerId) -> u32 {
        self.entries
            .get(&target)
            .map_or(0, |entry| entry.reconnect_attempts)
    }

    /// Count one more reconnection attempt and return the new total
    pub fn bump_reconnect(&mut self, target: PeerId) -> u32 {
        match self.entries.get_mut(&target) {
            Some(entry) => {
                entry.reconnect_attempts += 1;
                entry.reconnect_attempts
            }
            None => 0,
        }
    }

    pub fn reset_reconnect(&mut self, target: PeerId) {
        if let Some(entry) = self.entries.get_mut(&target) {
            entry.reconnect_attempts = 0;
        }
    }

    /// Forget a peer entirely (it left the room)
    pub fn forget(&mut self, target: PeerId) -> Option<DirectLinkState> {
        self.entries.remove(&target).map(|entry| entry.state)
    }

    /// Snapshot of every non-idle entry
    pub fn snapshot(&self) -> Vec<(PeerId, DirectLinkState)> {
        let mut rows: Vec<(PeerId, DirectLinkState)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state != DirectLinkState::Idle)
            .map(|(peer, entry)| (*peer, entry.state.clone()))
            .collect();
        rows.sort_by_key(|(peer, _)| *peer);
        rows
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_peer_id(id: u8) -> PeerId {
        PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_link_key_is_unordered() {
        let a = create_test_peer_id(1);
        let b = create_test_peer_id(2);
        assert_eq!(LinkKey::new(a, b), LinkKey::new(b, a));
        assert_eq!(LinkKey::new(b, a).low(), a);
        assert_eq!(LinkKey::new(a, b).other(a), Some(b));
        assert_eq!(LinkKey::new(a, b).other(create_test_peer_id(3)), None);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let now = Timestamp::new(1_000);
        let state = DirectLinkState::Idle
            .transition(LinkEvent::Initiate { role: LinkRole::Dialer }, now)
            .unwrap();
        assert_eq!(state.state_name(), "Pending");

        let state = state.transition(LinkEvent::Established, now).unwrap();
        assert!(state.is_usable());

        let state = state.transition(LinkEvent::QualityDropped, now).unwrap();
        assert!(state.is_live());
        assert!(!state.is_usable());

        let state = state.transition(LinkEvent::QualityRecovered, now).unwrap();
        assert!(state.is_usable());

        let later = now + Duration::from_secs(12);
        let state = state
            .transition(LinkEvent::Close { reason: "bye".into() }, later)
            .unwrap();
        assert_eq!(state.opened_at(), Some(now));
        assert!(!state.is_live());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let now = Timestamp::new(0);
        assert!(DirectLinkState::Idle
            .transition(LinkEvent::Established, now)
            .is_err());
        let open = DirectLinkState::Open {
            role: LinkRole::Dialer,
            opened_at: now,
        };
        assert!(open
            .clone()
            .transition(LinkEvent::Initiate { role: LinkRole::Dialer }, now)
            .is_err());
        assert!(open
            .transition(LinkEvent::AttemptFailed { reason: "x".into() }, now)
            .is_err());
    }

    #[test]
    fn test_reserve_is_check_and_set() {
        let now = Timestamp::new(0);
        let mut table = LinkTable::new(create_test_peer_id(1));
        let target = create_test_peer_id(2);

        assert_eq!(table.reserve(target, LinkRole::Dialer, now), Reservation::Proceed);
        assert_eq!(
            table.reserve(target, LinkRole::Responder, now),
            Reservation::AlreadyPending(LinkRole::Dialer)
        );
        assert_eq!(table.pending_count(), 1);

        table.mark_open(target, now).unwrap();
        assert_eq!(table.reserve(target, LinkRole::Dialer, now), Reservation::AlreadyOpen);
        assert_eq!(table.open_peers(), vec![target]);

        table.mark_closed(target, "gone", now).unwrap();
        assert_eq!(table.reserve(target, LinkRole::Dialer, now), Reservation::Proceed);
    }

    #[test]
    fn test_failed_attempt_releases_pair() {
        let now = Timestamp::new(0);
        let mut table = LinkTable::new(create_test_peer_id(1));
        let target = create_test_peer_id(2);
        table.reserve(target, LinkRole::Dialer, now);
        table.mark_failed(target, "timeout", now).unwrap();
        assert_eq!(table.pending_count(), 0);
        assert!(!table.is_live(target));
        assert_eq!(table.reserve(target, LinkRole::Dialer, now), Reservation::Proceed);
    }

    #[test]
    fn test_crossing_smaller_peer_keeps_dialing() {
        let now = Timestamp::new(0);
        let small = create_test_peer_id(1);
        let large = create_test_peer_id(9);

        let mut small_table = LinkTable::new(small);
        small_table.reserve(large, LinkRole::Dialer, now);
        assert_eq!(
            small_table.resolve_crossing(large),
            Some(CrossingDecision::KeepDialing)
        );

        let mut large_table = LinkTable::new(large);
        large_table.reserve(small, LinkRole::Dialer, now);
        assert_eq!(
            large_table.resolve_crossing(small),
            Some(CrossingDecision::BecomeResponder)
        );
        assert_eq!(
            large_table.state(small).and_then(DirectLinkState::role),
            Some(LinkRole::Responder)
        );
    }

    #[test]
    fn test_stability_tracking() {
        let start = Timestamp::new(0);
        let mut table = LinkTable::new(create_test_peer_id(1));
        let stable = create_test_peer_id(2);
        let flaky = create_test_peer_id(3);

        for peer in [stable, flaky] {
            table.reserve(peer, LinkRole::Dialer, start);
            table.mark_open(peer, start).unwrap();
        }
        let open_for = table
            .mark_closed(stable, "drop", start + Duration::from_secs(15))
            .unwrap();
        assert_eq!(open_for, Some(Duration::from_secs(15)));
        table
            .mark_closed(flaky, "drop", start + Duration::from_secs(2))
            .unwrap();

        assert!(table.was_stable(stable, Duration::from_secs(10)));
        assert!(!table.was_stable(flaky, Duration::from_secs(10)));

        assert_eq!(table.bump_reconnect(stable), 1);
        assert_eq!(table.bump_reconnect(stable), 2);
        table.reset_reconnect(stable);
        assert_eq!(table.reconnect_attempts(stable), 0);
    }

    #[test]
    fn test_degrade_and_recover_through_table() {
        let now = Timestamp::new(0);
        let mut table = LinkTable::new(create_test_peer_id(1));
        let target = create_test_peer_id(2);
        table.reserve(target, LinkRole::Responder, now);
        table.mark_open(target, now).unwrap();
        table.set_degraded(target, now).unwrap();
        assert!(table.open_peers().is_empty());
        assert_eq!(table.live_peers(), vec![target]);
        table.set_recovered(target, now).unwrap();
        assert_eq!(table.open_peers(), vec![target]);
        assert!(table.set_recovered(target, now).is_err());
        assert!(table.mark_open(create_test_peer_id(7), now).is_err());
    }
}
