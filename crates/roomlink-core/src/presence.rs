//! Presence records and the TTL-bounded presence registry
//!
//! Presence is a best-effort beacon each client broadcasts about itself:
//! its room, a self-reported quality and the direct links it currently
//! holds. The registry is an explicit service owned by peer discovery;
//! records are never trusted past their time-to-live.

use core::time::Duration;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::types::{PeerId, RoomId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Presence Record
// ----------------------------------------------------------------------------

/// Quality of one direct link as reported by its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub peer_id: PeerId,
    pub quality: u8,
}

/// Capability tag advertising that a client can act as a bridge node
pub const CAPABILITY_BRIDGE: &str = "bridge";

/// Capability tag advertising that a client accepts direct links
pub const CAPABILITY_DIRECT: &str = "direct";

/// Self-reported liveness and quality beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub timestamp: Timestamp,
    /// Self-reported relayed-connection quality (0-100)
    pub quality: u8,
    #[serde(default)]
    pub capabilities: SmallVec<[String; 4]>,
    /// Direct links held by the reporting peer
    #[serde(default)]
    pub links: Vec<LinkReport>,
}

impl PresenceRecord {
    pub fn new(peer_id: PeerId, room_id: RoomId, timestamp: Timestamp, quality: u8) -> Self {
        Self {
            peer_id,
            room_id,
            timestamp,
            quality: quality.min(100),
            capabilities: SmallVec::new(),
            links: Vec::new(),
        }
    }

    /// Builder method for adding a capability tag
    pub fn with_capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Builder method for attaching the current link report
    pub fn with_links(mut self, links: Vec<LinkReport>) -> Self {
        self.links = links;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Reported quality of the holder's direct link to `peer_id`
    pub fn link_quality_to(&self, peer_id: PeerId) -> Option<u8> {
        self.links
            .iter()
            .find(|link| link.peer_id == peer_id)
            .map(|link| link.quality)
    }

    pub fn is_fresh(&self, now: Timestamp, ttl: Duration) -> bool {
        now - self.timestamp <= ttl
    }
}

// ----------------------------------------------------------------------------
// Presence Registry
// ----------------------------------------------------------------------------

/// TTL-evicting table of the newest presence record per peer
pub struct PresenceRegistry {
    ttl: Duration,
    records: HashMap<PeerId, PresenceRecord>,
    clock: Arc<dyn TimeSource>,
}

impl core::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("ttl", &self.ttl)
            .field("records", &self.records.len())
            .finish()
    }
}

impl PresenceRegistry {
    pub fn new(ttl: Duration, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            ttl,
            records: HashMap::new(),
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a record; returns `false` if it was already stale or older
    /// than what we hold for that peer
    pub fn observe(&mut self, record: PresenceRecord) -> bool {
        let now = self.clock.now();
        if !record.is_fresh(now, self.ttl) {
            trace!("Ignoring stale presence from {}", record.peer_id.short());
            return false;
        }
        match self.records.get(&record.peer_id) {
            Some(existing) if existing.timestamp > record.timestamp => false,
            _ => {
                self.records.insert(record.peer_id, record);
                true
            }
        }
    }

    /// Evict every record past its TTL; returns the evicted peers
    pub fn purge_stale(&mut self) -> Vec<PeerId> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut evicted = Vec::new();
        self.records.retain(|peer_id, record| {
            let keep = record.is_fresh(now, ttl);
            if !keep {
                evicted.push(*peer_id);
            }
            keep
        });
        if !evicted.is_empty() {
            debug!("Purged {} stale presence records", evicted.len());
        }
        evicted
    }

    /// Fresh record for a peer
    pub fn get(&self, peer_id: PeerId) -> Option<&PresenceRecord> {
        let now = self.clock.now();
        self.records
            .get(&peer_id)
            .filter(|record| record.is_fresh(now, self.ttl))
    }

    /// Fresh records of peers in `room`
    pub fn fresh_in_room(&self, room: &RoomId) -> Vec<&PresenceRecord> {
        let now = self.clock.now();
        self.records
            .values()
            .filter(|record| &record.room_id == room && record.is_fresh(now, self.ttl))
            .collect()
    }

    pub fn remove(&mut self, peer_id: PeerId) -> Option<PresenceRecord> {
        self.records.remove(&peer_id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;

    fn create_test_peer_id(id: u8) -> PeerId {
        PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
    }

    fn room() -> RoomId {
        RoomId::new("lobby").unwrap()
    }

    fn registry(clock: &ManualTimeSource) -> PresenceRegistry {
        PresenceRegistry::new(Duration::from_secs(30), Arc::new(clock.clone()))
    }

    #[test]
    fn test_stale_records_are_rejected() {
        let clock = ManualTimeSource::new();
        let mut registry = registry(&clock);
        let old = clock.now().saturating_sub(Duration::from_secs(31));
        assert!(!registry.observe(PresenceRecord::new(create_test_peer_id(1), room(), old, 80)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_newest_record_wins() {
        let clock = ManualTimeSource::new();
        let mut registry = registry(&clock);
        let peer = create_test_peer_id(1);
        let now = clock.now();
        assert!(registry.observe(PresenceRecord::new(peer, room(), now, 80)));
        assert!(!registry.observe(PresenceRecord::new(
            peer,
            room(),
            now.saturating_sub(Duration::from_secs(1)),
            20
        )));
        assert_eq!(registry.get(peer).map(|r| r.quality), Some(80));
    }

    #[test]
    fn test_purge_after_ttl() {
        let clock = ManualTimeSource::new();
        let mut registry = registry(&clock);
        let peer = create_test_peer_id(1);
        registry.observe(PresenceRecord::new(peer, room(), clock.now(), 80));
        assert_eq!(registry.fresh_in_room(&room()).len(), 1);

        clock.advance(Duration::from_secs(31));
        assert!(registry.get(peer).is_none());
        assert!(registry.fresh_in_room(&room()).is_empty());
        assert_eq!(registry.purge_stale(), vec![peer]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_link_report_lookup() {
        let record = PresenceRecord::new(create_test_peer_id(1), room(), Timestamp::new(0), 150)
            .with_capability(CAPABILITY_BRIDGE)
            .with_links(vec![LinkReport {
                peer_id: create_test_peer_id(2),
                quality: 70,
            }]);
        assert_eq!(record.quality, 100);
        assert!(record.has_capability(CAPABILITY_BRIDGE));
        assert_eq!(record.link_quality_to(create_test_peer_id(2)), Some(70));
        assert_eq!(record.link_quality_to(create_test_peer_id(3)), None);
    }
}
