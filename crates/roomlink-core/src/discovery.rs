//! Peer discovery
//!
//! Turns the coordinator roster and the local presence table into a short,
//! ordered list of direct-link upgrade candidates. The roster is
//! authoritative; presence only fills in while the coordinator is
//! unreachable or for peers the server has not reflected yet.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::presence::{PresenceRecord, PresenceRegistry};
use crate::protocol::PeerInfo;
use crate::types::{PeerId, RoomId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Candidate
// ----------------------------------------------------------------------------

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateSource {
    Coordinator,
    Presence,
}

/// A peer worth attempting a direct link to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub peer_id: PeerId,
    pub quality: u8,
    pub last_seen: Timestamp,
    pub source: CandidateSource,
}

#[derive(Debug, Clone)]
struct RosterEntry {
    display_name: String,
    seen_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Peer Discovery
// ----------------------------------------------------------------------------

/// Merges roster and presence into upgrade candidates
pub struct PeerDiscovery {
    local: PeerId,
    config: DiscoveryConfig,
    registry: PresenceRegistry,
    rosters: HashMap<RoomId, HashMap<PeerId, RosterEntry>>,
    roster_available: bool,
    clock: Arc<dyn TimeSource>,
}

impl core::fmt::Debug for PeerDiscovery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerDiscovery")
            .field("local", &self.local)
            .field("registry", &self.registry)
            .field("rooms", &self.rosters.len())
            .field("roster_available", &self.roster_available)
            .finish()
    }
}

impl PeerDiscovery {
    pub fn new(local: PeerId, config: DiscoveryConfig, clock: Arc<dyn TimeSource>) -> Self {
        let registry = PresenceRegistry::new(config.presence_ttl, clock.clone());
        Self {
            local,
            config,
            registry,
            rosters: HashMap::new(),
            roster_available: true,
            clock,
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PresenceRegistry {
        &mut self.registry
    }

    /// Replace the roster of a room with what the coordinator returned
    pub fn update_roster(&mut self, room: &RoomId, peers: &[PeerInfo]) {
        let now = self.clock.now();
        let roster = peers
            .iter()
            .filter(|peer| peer.peer_id != self.local)
            .map(|peer| {
                (
                    peer.peer_id,
                    RosterEntry {
                        display_name: peer.display_name.clone(),
                        seen_at: now,
                    },
                )
            })
            .collect();
        self.rosters.insert(room.clone(), roster);
        self.roster_available = true;
    }

    /// A `peer-joined` arrived
    pub fn add_roster_peer(&mut self, room: &RoomId, peer: PeerInfo) {
        if peer.peer_id == self.local {
            return;
        }
        let now = self.clock.now();
        self.rosters.entry(room.clone()).or_default().insert(
            peer.peer_id,
            RosterEntry {
                display_name: peer.display_name,
                seen_at: now,
            },
        );
    }

    /// A `peer-left` arrived; forget its roster entry and presence
    pub fn remove_peer(&mut self, room: &RoomId, peer_id: PeerId) {
        if let Some(roster) = self.rosters.get_mut(room) {
            roster.remove(&peer_id);
        }
        self.registry.remove(peer_id);
    }

    pub fn forget_room(&mut self, room: &RoomId) {
        self.rosters.remove(room);
    }

    /// Coordinator reachability; while unavailable presence alone feeds
    /// discovery
    pub fn set_roster_available(&mut self, available: bool) {
        self.roster_available = available;
    }

    pub fn roster_available(&self) -> bool {
        self.roster_available
    }

    /// Display name known for a roster peer
    pub fn display_name(&self, room: &RoomId, peer_id: PeerId) -> Option<&str> {
        self.rosters
            .get(room)
            .and_then(|roster| roster.get(&peer_id))
            .map(|entry| entry.display_name.as_str())
    }

    /// Roster peers of a room, in PeerId order
    pub fn roster_peers(&self, room: &RoomId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .rosters
            .get(room)
            .map(|roster| roster.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Fold in a presence beacon
    pub fn observe_presence(&mut self, record: PresenceRecord) -> bool {
        if record.peer_id == self.local {
            return false;
        }
        self.registry.observe(record)
    }

    /// Ordered, capped upgrade candidates for `room`, excluding peers in
    /// `exclude` (already linked or pending)
    pub fn discover(&mut self, room: &RoomId, exclude: &[PeerId]) -> Vec<Candidate> {
        self.registry.purge_stale();

        let mut merged: HashMap<PeerId, Candidate> = HashMap::new();

        if self.roster_available {
            if let Some(roster) = self.rosters.get(room) {
                for (peer_id, entry) in roster {
                    merged.insert(
                        *peer_id,
                        Candidate {
                            peer_id: *peer_id,
                            quality: self.config.coordinator_quality,
                            last_seen: entry.seen_at,
                            source: CandidateSource::Coordinator,
                        },
                    );
                }
            }
        }

        for record in self.registry.fresh_in_room(room) {
            match merged.get_mut(&record.peer_id) {
                // Coordinator wins ties; presence only refreshes last-seen
                Some(existing) => {
                    if record.timestamp > existing.last_seen {
                        existing.last_seen = record.timestamp;
                    }
                }
                None => {
                    merged.insert(
                        record.peer_id,
                        Candidate {
                            peer_id: record.peer_id,
                            quality: record.quality,
                            last_seen: record.timestamp,
                            source: CandidateSource::Presence,
                        },
                    );
                }
            }
        }

        let mut candidates: Vec<Candidate> = merged
            .into_values()
            .filter(|candidate| candidate.peer_id != self.local)
            .filter(|candidate| !exclude.contains(&candidate.peer_id))
            .collect();
        candidates.sort_by(|a, b| {
            b.quality
                .cmp(&a.quality)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        candidates.truncate(self.config.max_candidates);

        debug!(
            "Discovery in {} produced {} candidates",
            room,
            candidates.len()
        );
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;
    use core::time::Duration;

    fn create_test_peer_id(id: u8) -> PeerId {
        PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
    }

    fn room() -> RoomId {
        RoomId::new("lobby").unwrap()
    }

    fn info(id: u8) -> PeerInfo {
        PeerInfo {
            peer_id: create_test_peer_id(id),
            display_name: format!("peer-{id}"),
        }
    }

    fn discovery(clock: &ManualTimeSource) -> PeerDiscovery {
        PeerDiscovery::new(
            create_test_peer_id(1),
            DiscoveryConfig::default(),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_roster_wins_ties_and_self_is_dropped() {
        let clock = ManualTimeSource::new();
        let mut discovery = discovery(&clock);
        discovery.update_roster(&room(), &[info(1), info(2)]);
        discovery.observe_presence(PresenceRecord::new(create_test_peer_id(2), room(), clock.now(), 10));

        let candidates = discovery.discover(&room(), &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, create_test_peer_id(2));
        assert_eq!(candidates[0].quality, 100);
        assert_eq!(candidates[0].source, CandidateSource::Coordinator);
    }

    #[test]
    fn test_presence_recovers_unlisted_peers() {
        let clock = ManualTimeSource::new();
        let mut discovery = discovery(&clock);
        discovery.update_roster(&room(), &[info(2)]);
        discovery.observe_presence(PresenceRecord::new(create_test_peer_id(3), room(), clock.now(), 70));

        let candidates = discovery.discover(&room(), &[]);
        let ids: Vec<PeerId> = candidates.iter().map(|c| c.peer_id).collect();
        assert_eq!(ids, vec![create_test_peer_id(2), create_test_peer_id(3)]);
        assert_eq!(candidates[1].source, CandidateSource::Presence);
    }

    #[test]
    fn test_stale_presence_is_discarded_before_merge() {
        let clock = ManualTimeSource::new();
        let mut discovery = discovery(&clock);
        discovery.set_roster_available(false);
        discovery.observe_presence(PresenceRecord::new(create_test_peer_id(3), room(), clock.now(), 70));
        clock.advance(Duration::from_secs(31));
        assert!(discovery.discover(&room(), &[]).is_empty());
        assert!(discovery.registry().is_empty());
    }

    #[test]
    fn test_unavailable_roster_falls_back_to_presence() {
        let clock = ManualTimeSource::new();
        let mut discovery = discovery(&clock);
        discovery.update_roster(&room(), &[info(2)]);
        discovery.set_roster_available(false);
        discovery.observe_presence(PresenceRecord::new(create_test_peer_id(4), room(), clock.now(), 50));
        let ids: Vec<PeerId> = discovery
            .discover(&room(), &[])
            .iter()
            .map(|c| c.peer_id)
            .collect();
        assert_eq!(ids, vec![create_test_peer_id(4)]);
    }

    #[test]
    fn test_output_is_capped_and_excludes_linked_peers() {
        let clock = ManualTimeSource::new();
        let mut discovery = discovery(&clock);
        discovery.update_roster(&room(), &[info(2), info(3), info(4), info(5), info(6)]);
        let candidates = discovery.discover(&room(), &[create_test_peer_id(2)]);
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.peer_id != create_test_peer_id(2)));
    }

    #[test]
    fn test_remove_peer_forgets_roster_and_presence() {
        let clock = ManualTimeSource::new();
        let mut discovery = discovery(&clock);
        discovery.update_roster(&room(), &[info(2)]);
        discovery.observe_presence(PresenceRecord::new(create_test_peer_id(2), room(), clock.now(), 70));
        discovery.remove_peer(&room(), create_test_peer_id(2));
        assert!(discovery.discover(&room(), &[]).is_empty());
        assert_eq!(discovery.display_name(&room(), create_test_peer_id(2)), None);
    }
}
