//! Outbound queue for messages with no viable path
//!
//! Messages wait here FIFO until any path opens. A message that has been
//! flushed unsuccessfully too many times, or waited too long, is dropped and
//! handed back so the caller can report the failure.

use std::collections::VecDeque;
use tracing::warn;

use crate::config::QueueConfig;
use crate::message::ChatMessage;
use crate::types::Timestamp;

/// A message parked while no path is viable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: ChatMessage,
    pub enqueued_at: Timestamp,
    pub retries: u32,
}

/// Why a queued message was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    TooManyRetries,
    Expired,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue full",
            DropReason::TooManyRetries => "retry budget exhausted",
            DropReason::Expired => "queued too long",
        }
    }
}

/// Result of one flush pass
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub sent: usize,
    pub dropped: Vec<(QueuedMessage, DropReason)>,
}

/// Bounded FIFO of undeliverable messages
#[derive(Debug)]
pub struct OutboundQueue {
    config: QueueConfig,
    entries: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park a message; returns the oldest entry if it had to make room
    pub fn push(&mut self, message: ChatMessage, now: Timestamp) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.config.max_len.max(1) {
            self.entries.pop_front()
        } else {
            None
        };
        if let Some(entry) = &evicted {
            warn!("Outbound queue full, dropping message {}", entry.message.id);
        }
        self.entries.push_back(QueuedMessage {
            message,
            enqueued_at: now,
            retries: 0,
        });
        evicted
    }

    /// Drop entries older than `max_age`
    pub fn expire(&mut self, now: Timestamp) -> Vec<QueuedMessage> {
        let max_age = self.config.max_age;
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|entry| now - entry.enqueued_at > max_age);
        self.entries = kept.into();
        expired
    }

    /// Try every entry in FIFO order with `send`; entries `send` refuses are
    /// kept with one more retry counted, until their budget runs out
    pub fn flush<F>(&mut self, now: Timestamp, mut send: F) -> FlushOutcome
    where
        F: FnMut(&ChatMessage) -> bool,
    {
        let mut outcome = FlushOutcome::default();
        for entry in self.expire(now) {
            outcome.dropped.push((entry, DropReason::Expired));
        }

        let pending: Vec<QueuedMessage> = self.entries.drain(..).collect();
        for mut entry in pending {
            if send(&entry.message) {
                outcome.sent += 1;
                continue;
            }
            entry.retries += 1;
            if entry.retries >= self.config.max_retries {
                outcome.dropped.push((entry, DropReason::TooManyRetries));
            } else {
                self.entries.push_back(entry);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerId, RoomId};
    use core::time::Duration;

    fn message(content: &str) -> ChatMessage {
        ChatMessage::new(
            RoomId::new("lobby").unwrap(),
            PeerId::new([1; 8]),
            "ann",
            content,
            Timestamp::new(0),
        )
    }

    fn queue(max_len: usize, max_retries: u32) -> OutboundQueue {
        OutboundQueue::new(QueueConfig {
            max_len,
            max_retries,
            max_age: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_flush_is_fifo() {
        let mut queue = queue(8, 3);
        let now = Timestamp::new(0);
        queue.push(message("a"), now);
        queue.push(message("b"), now);
        let mut order = Vec::new();
        let outcome = queue.flush(now, |m| {
            order.push(m.content.clone());
            true
        });
        assert_eq!(outcome.sent, 2);
        assert_eq!(order, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let mut queue = queue(2, 3);
        let now = Timestamp::new(0);
        queue.push(message("a"), now);
        queue.push(message("b"), now);
        let evicted = queue.push(message("c"), now).unwrap();
        assert_eq!(evicted.message.content, "a");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_retry_budget_drops_entry() {
        let mut queue = queue(8, 2);
        let now = Timestamp::new(0);
        queue.push(message("a"), now);
        assert!(queue.flush(now, |_| false).dropped.is_empty());
        let outcome = queue.flush(now, |_| false);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].1, DropReason::TooManyRetries);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_aged_entries_expire() {
        let mut queue = queue(8, 5);
        let start = Timestamp::new(0);
        queue.push(message("old"), start);
        queue.push(message("new"), start + Duration::from_secs(50));
        let outcome = queue.flush(start + Duration::from_secs(61), |_| false);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].0.message.content, "old");
        assert_eq!(outcome.dropped[0].1, DropReason::Expired);
        assert_eq!(queue.len(), 1);
    }
}
