//! Inbound message deduplication
//!
//! The same message can legitimately arrive over a direct link, the relayed
//! channel and a bridge during overlap windows. A bounded window of recent
//! fingerprints per room lets exactly one copy through.

use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

use crate::message::Fingerprint;
use crate::types::RoomId;

// ----------------------------------------------------------------------------
// Dedup Window
// ----------------------------------------------------------------------------

/// Bounded FIFO set of the most recent fingerprints
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a fingerprint; returns `true` the first time it is seen
    pub fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        if self.seen.contains(&fingerprint) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(fingerprint);
        self.order.push_back(fingerprint);
        true
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// One dedup window per room
#[derive(Debug, Clone)]
pub struct RoomDedup {
    capacity: usize,
    rooms: HashMap<RoomId, DedupWindow>,
}

impl RoomDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rooms: HashMap::new(),
        }
    }

    /// Returns `true` if this is the first copy seen in `room`
    pub fn check_and_insert(&mut self, room: &RoomId, fingerprint: Fingerprint) -> bool {
        let capacity = self.capacity;
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| DedupWindow::new(capacity))
            .insert(fingerprint)
    }

    /// Whether `room` has already seen the fingerprint, without recording it
    pub fn seen(&self, room: &RoomId, fingerprint: &Fingerprint) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|window| window.contains(fingerprint))
    }

    /// Drop the window of a room we left
    pub fn forget_room(&mut self, room: &RoomId) {
        self.rooms.remove(room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, PeerId};

    fn fingerprint(n: u8) -> Fingerprint {
        Fingerprint::new(PeerId::new([n, 0, 0, 0, 0, 0, 0, 0]), MessageId::new())
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut window = DedupWindow::new(4);
        let fp = fingerprint(1);
        assert!(window.insert(fp));
        assert!(!window.insert(fp));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        let first = fingerprint(1);
        window.insert(first);
        window.insert(fingerprint(2));
        window.insert(fingerprint(3));
        assert_eq!(window.len(), 2);
        assert!(!window.contains(&first));
        assert!(window.insert(first));
    }

    #[test]
    fn test_rooms_are_independent() {
        let mut dedup = RoomDedup::new(8);
        let lobby = RoomId::new("lobby").unwrap();
        let attic = RoomId::new("attic").unwrap();
        let fp = fingerprint(1);
        assert!(dedup.check_and_insert(&lobby, fp));
        assert!(dedup.check_and_insert(&attic, fp));
        assert!(!dedup.check_and_insert(&lobby, fp));
        dedup.forget_room(&lobby);
        assert!(!dedup.seen(&lobby, &fp));
    }
}
