//! Multi-hop bridge relaying
//!
//! When both the direct link and the relayed path to a recipient are
//! insufficient, a message is handed to a third participant that has good
//! links on both sides. The envelope carries a hop count; every transmission
//! increments it and no node forwards past the configured cap.

use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::message::{ChatMessage, Priority};
use crate::quality::QualityTier;
use crate::types::{MessageId, PeerId};

// ----------------------------------------------------------------------------
// Bridge Envelope
// ----------------------------------------------------------------------------

/// A chat message in transit through bridge nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    pub message: ChatMessage,
    pub origin: PeerId,
    pub final_recipient: PeerId,
    /// Transmissions so far, including the one that delivered this copy
    pub hop_count: u8,
    /// Nodes that have held the envelope, origin first
    pub path: Vec<PeerId>,
}

impl BridgeEnvelope {
    /// Envelope as it leaves the origin for its first hop
    pub fn new(message: ChatMessage, origin: PeerId, final_recipient: PeerId) -> Self {
        let mut message = message;
        message.hop_count = 1;
        Self {
            message,
            origin,
            final_recipient,
            hop_count: 1,
            path: vec![origin],
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message.id
    }

    /// Whether one more transmission stays within `hop_cap`
    pub fn can_forward(&self, hop_cap: u8) -> bool {
        self.hop_count < hop_cap
    }

    /// Copy of the envelope as forwarded by `via`
    pub fn forwarded_by(&self, via: PeerId) -> Self {
        let mut next = self.clone();
        next.hop_count = self.hop_count.saturating_add(1);
        next.message.hop_count = next.hop_count;
        next.path.push(via);
        next
    }

    /// Node to send acknowledgements back to from `local`
    pub fn previous_hop(&self, local: PeerId) -> PeerId {
        match self.path.iter().position(|peer| *peer == local) {
            Some(0) | None => self.path.last().copied().unwrap_or(self.origin),
            Some(index) => self.path[index - 1],
        }
    }
}

/// Why a bridge node refused an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NackReason {
    /// Forwarding would exceed the hop cap
    RelayExhausted,
    /// The node has no path to the recipient
    Unreachable,
    /// The node does not act as a bridge
    Declined,
}

// ----------------------------------------------------------------------------
// Node Decision
// ----------------------------------------------------------------------------

/// What a node does with an envelope it received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStep {
    /// We are the final recipient
    Deliver,
    /// Forward over our open direct link to the recipient
    ForwardDirect(BridgeEnvelope),
    /// Forward through the coordinator's relayed unicast
    ForwardRelayed(BridgeEnvelope),
    /// Refuse and notify the origin
    Reject(NackReason),
}

/// Decide the next step for an envelope held by `local`
pub fn next_step(
    envelope: &BridgeEnvelope,
    local: PeerId,
    config: &BridgeConfig,
    direct_to_recipient: bool,
    relay_available: bool,
) -> BridgeStep {
    if envelope.final_recipient == local {
        return BridgeStep::Deliver;
    }
    if !config.enabled {
        return BridgeStep::Reject(NackReason::Declined);
    }
    if envelope.path.contains(&local) || !envelope.can_forward(config.hop_cap) {
        return BridgeStep::Reject(NackReason::RelayExhausted);
    }
    let next = envelope.forwarded_by(local);
    if direct_to_recipient {
        BridgeStep::ForwardDirect(next)
    } else if relay_available {
        BridgeStep::ForwardRelayed(next)
    } else {
        BridgeStep::Reject(NackReason::Unreachable)
    }
}

// ----------------------------------------------------------------------------
// Bridge Selection
// ----------------------------------------------------------------------------

/// A participant considered for relaying to one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeCandidate {
    pub peer_id: PeerId,
    /// Measured score of our own direct link to the candidate
    pub sender_link: u8,
    /// Candidate's self-reported direct link score to the recipient
    pub recipient_link: Option<u8>,
    /// Candidate's self-reported relayed-connection quality
    pub relay_quality: u8,
}

impl BridgeCandidate {
    /// Holds an open direct link to the recipient
    pub fn is_one_hop(&self) -> bool {
        self.recipient_link.is_some()
    }

    /// Quality of the candidate's onward leg
    fn onward_quality(&self) -> u8 {
        self.recipient_link.unwrap_or(self.relay_quality)
    }

    pub fn combined_quality(&self) -> u16 {
        self.sender_link as u16 + self.onward_quality() as u16
    }

    fn is_eligible(&self) -> bool {
        QualityTier::from_score(self.sender_link).is_healthy()
            && QualityTier::from_score(self.onward_quality()).is_healthy()
    }
}

/// Ranks bridge candidates for one recipient
#[derive(Debug, Clone, Default)]
pub struct BridgeSelector;

impl BridgeSelector {
    pub fn new() -> Self {
        Self
    }

    /// Eligible candidates, best first: one-hop nodes before two-hop ones,
    /// then by combined quality
    pub fn rank(
        &self,
        candidates: Vec<BridgeCandidate>,
        sender: PeerId,
        recipient: PeerId,
    ) -> Vec<BridgeCandidate> {
        let mut ranked: Vec<BridgeCandidate> = candidates
            .into_iter()
            .filter(|candidate| candidate.peer_id != sender && candidate.peer_id != recipient)
            .filter(BridgeCandidate::is_eligible)
            .collect();
        ranked.sort_by(|a, b| {
            b.is_one_hop()
                .cmp(&a.is_one_hop())
                .then_with(|| b.combined_quality().cmp(&a.combined_quality()))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        ranked
    }

    /// Bridge nodes to try for a message of this priority
    pub fn attempt_budget(&self, priority: Priority, config: &BridgeConfig) -> usize {
        match priority {
            Priority::Critical => config.critical_max_attempts.max(1) as usize,
            Priority::Normal => 1,
        }
    }
}
