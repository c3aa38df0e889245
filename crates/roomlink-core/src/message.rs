//! Chat messages and their dedup fingerprints

use core::fmt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Result, RoomlinkError};
use crate::types::{MessageId, PeerId, RoomId, Timestamp};

// ----------------------------------------------------------------------------
// Priority
// ----------------------------------------------------------------------------

/// Delivery priority, consulted only by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    /// Best effort, single bridge attempt
    #[default]
    Normal,
    /// Acknowledged bridge delivery with retries through alternate nodes
    Critical,
}

// ----------------------------------------------------------------------------
// Chat Message
// ----------------------------------------------------------------------------

/// A chat message as carried on every path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender: PeerId,
    pub display_name: String,
    pub content: String,
    /// Client send time
    pub sent_at: Timestamp,
    /// Server-assigned delivery time, present on relayed echoes
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
    /// Bridge hops taken so far
    #[serde(default)]
    pub hop_count: u8,
    #[serde(default)]
    pub priority: Priority,
}

impl ChatMessage {
    /// Create a new outbound message stamped with `sent_at`
    pub fn new<N: Into<String>, C: Into<String>>(
        room_id: RoomId,
        sender: PeerId,
        display_name: N,
        content: C,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::new(),
            room_id,
            sender,
            display_name: display_name.into(),
            content: content.into(),
            sent_at,
            delivered_at: None,
            hop_count: 0,
            priority: Priority::Normal,
        }
    }

    /// Builder method for setting the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Dedup fingerprint: sender plus client-generated id
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.sender, self.id)
    }

    /// Reject content the coordinator would refuse to broadcast
    pub fn validate(&self, max_len: usize) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(RoomlinkError::invalid_message("Message content is empty"));
        }
        if self.content.chars().count() > max_len {
            return Err(RoomlinkError::invalid_message(format!(
                "Message content exceeds {max_len} characters"
            )));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Fingerprint
// ----------------------------------------------------------------------------

/// Compact identity of a message across paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Hash of sender and message id
    pub fn new(sender: PeerId, id: MessageId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(id.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}
