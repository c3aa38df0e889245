//! Message history persistence
//!
//! The client records every message it receives and each of its own once
//! delivery is confirmed, and replays a room's history when it joins. Storage is pluggable; [`MemoryHistory`] keeps a bounded
//! per-room buffer.

use roomlink_core::{ChatMessage, RoomId};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Storage for room history
pub trait HistorySink: Send + Sync {
    fn record(&self, message: &ChatMessage);

    /// Stored messages for `room_id`, oldest first
    fn replay(&self, room_id: &RoomId) -> Vec<ChatMessage>;
}

/// Bounded in-memory history
#[derive(Debug)]
pub struct MemoryHistory {
    capacity: usize,
    rooms: Mutex<HashMap<RoomId, VecDeque<ChatMessage>>>,
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(500)
    }
}

impl HistorySink for MemoryHistory {
    fn record(&self, message: &ChatMessage) {
        let mut rooms = self
            .rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let room = rooms.entry(message.room_id.clone()).or_default();
        if room
            .iter()
            .any(|stored| stored.sender == message.sender && stored.id == message.id)
        {
            return;
        }
        if room.len() >= self.capacity {
            room.pop_front();
        }
        room.push_back(message.clone());
    }

    fn replay(&self, room_id: &RoomId) -> Vec<ChatMessage> {
        self.rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(room_id)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_core::{PeerId, Timestamp};

    #[test]
    fn test_history_is_bounded_and_skips_repeats() {
        let history = MemoryHistory::new(2);
        let room = RoomId::new("lobby").unwrap();
        let sender = PeerId::new([1, 0, 0, 0, 0, 0, 0, 0]);
        let first = ChatMessage::new(room.clone(), sender, "ann", "one", Timestamp::new(1));
        let second = ChatMessage::new(room.clone(), sender, "ann", "two", Timestamp::new(2));
        let third = ChatMessage::new(room.clone(), sender, "ann", "three", Timestamp::new(3));

        history.record(&first);
        history.record(&first);
        history.record(&second);
        history.record(&third);

        let replayed = history.replay(&room);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].content, "two");
        assert_eq!(replayed[1].content, "three");
        assert!(history.replay(&RoomId::new("other").unwrap()).is_empty());
    }
}
