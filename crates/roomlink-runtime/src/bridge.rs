//! Message Bridge
//!
//! Origin side: hand a message for one recipient to the best-ranked bridge
//! node over a direct link and wait for the acknowledgement. Critical
//! messages move on to the next candidate after a NACK or a timeout, up to
//! the configured attempt budget; normal messages get one attempt and a
//! timeout counts as best-effort delivery.
//!
//! Node side: deliver envelopes addressed to us, forward others one hop
//! further when the hop cap allows, and pass acknowledgements back toward
//! the origin.

use roomlink_core::{
    bridge::next_step, config::BridgeConfig, presence::CAPABILITY_BRIDGE, BridgeCandidate,
    BridgeEnvelope, BridgeSelector, BridgeStep, ChatMessage, MessageId, NackReason, PeerFrame,
    PeerId, Priority, PresenceRegistry, SignalingMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::mesh::MeshUpgradeManager;
use crate::relay::RelayHandle;

/// Final result of bridging one message to one recipient
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    Delivered {
        message_id: MessageId,
        recipient: PeerId,
        via: PeerId,
        /// False when a normal-priority attempt simply went unanswered
        acknowledged: bool,
    },
    /// Every candidate refused or timed out; the caller falls back
    Exhausted {
        message: ChatMessage,
        recipient: PeerId,
        reason: NackReason,
    },
}

/// What handling an inbound bridge frame amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeHandled {
    /// We are the final recipient
    Deliver(ChatMessage),
    /// Forwarded one hop further for someone else
    Forwarded,
    Rejected(NackReason),
    /// An acknowledgement reached us or was passed along
    Acknowledged,
    Ignored,
}

#[derive(Debug)]
enum Reply {
    Ack,
    Nack(NackReason),
}

type PendingKey = (MessageId, PeerId);

// ----------------------------------------------------------------------------
// Message Bridge
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MessageBridge {
    local: PeerId,
    config: BridgeConfig,
    selector: BridgeSelector,
    mesh: MeshUpgradeManager,
    relay: RelayHandle,
    pending: Arc<Mutex<HashMap<PendingKey, oneshot::Sender<Reply>>>>,
    outcomes: mpsc::UnboundedSender<BridgeOutcome>,
}

impl MessageBridge {
    pub fn new(
        local: PeerId,
        config: BridgeConfig,
        mesh: MeshUpgradeManager,
        relay: RelayHandle,
        outcomes: mpsc::UnboundedSender<BridgeOutcome>,
    ) -> Self {
        Self {
            local,
            config,
            selector: BridgeSelector::new(),
            mesh,
            relay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            outcomes,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<PendingKey, oneshot::Sender<Reply>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bridge candidates for `recipient` among our usable direct links,
    /// enriched with what their presence records report
    pub fn candidates(&self, recipient: PeerId, registry: &PresenceRegistry) -> Vec<BridgeCandidate> {
        self.mesh
            .usable_links()
            .into_iter()
            .filter(|(peer, _)| *peer != recipient)
            .filter_map(|(peer_id, sender_link)| {
                let record = registry.get(peer_id)?;
                if !record.has_capability(CAPABILITY_BRIDGE) {
                    return None;
                }
                Some(BridgeCandidate {
                    peer_id,
                    sender_link,
                    recipient_link: record.link_quality_to(recipient),
                    relay_quality: record.quality,
                })
            })
            .collect()
    }

    /// Start bridging `message` to `recipient`; the result arrives on the
    /// outcome channel
    pub fn dispatch(&self, message: ChatMessage, recipient: PeerId, candidates: Vec<BridgeCandidate>) {
        let ranked = self.selector.rank(candidates, self.local, recipient);
        let budget = self.selector.attempt_budget(message.priority, &self.config);
        let bridge = self.clone();
        tokio::spawn(async move {
            let outcome = bridge.run_attempts(message, recipient, ranked, budget).await;
            let _ = bridge.outcomes.send(outcome);
        });
    }

    async fn run_attempts(
        &self,
        message: ChatMessage,
        recipient: PeerId,
        ranked: Vec<BridgeCandidate>,
        budget: usize,
    ) -> BridgeOutcome {
        let message_id = message.id;
        let mut reason = NackReason::Unreachable;

        for candidate in ranked.into_iter().take(budget) {
            let key = (message_id, recipient);
            let (tx, rx) = oneshot::channel();
            self.pending().insert(key, tx);

            let envelope = BridgeEnvelope::new(message.clone(), self.local, recipient);
            if !self
                .mesh
                .send_frame(candidate.peer_id, PeerFrame::Bridge(envelope))
            {
                self.pending().remove(&key);
                continue;
            }
            debug!(
                "Bridging {} to {} via {}",
                message_id,
                recipient.short(),
                candidate.peer_id.short()
            );

            match timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(Reply::Ack)) => {
                    return BridgeOutcome::Delivered {
                        message_id,
                        recipient,
                        via: candidate.peer_id,
                        acknowledged: true,
                    }
                }
                Ok(Ok(Reply::Nack(nack))) => {
                    debug!("{} refused {}: {:?}", candidate.peer_id.short(), message_id, nack);
                    reason = nack;
                }
                Ok(Err(_)) | Err(_) => {
                    self.pending().remove(&key);
                    if message.priority == Priority::Normal {
                        return BridgeOutcome::Delivered {
                            message_id,
                            recipient,
                            via: candidate.peer_id,
                            acknowledged: false,
                        };
                    }
                    reason = NackReason::Unreachable;
                }
            }
        }

        info!("No bridge delivered {} to {}", message_id, recipient.short());
        BridgeOutcome::Exhausted {
            message,
            recipient,
            reason,
        }
    }

    /// Send a frame toward `peer`: direct link if usable, otherwise relayed
    /// unicast through the coordinator
    fn send_toward(&self, peer: PeerId, frame: PeerFrame) -> bool {
        if self.mesh.is_usable(peer) && self.mesh.send_frame(peer, frame.clone()) {
            return true;
        }
        self.relay.send(SignalingMessage::Relay {
            target_peer_id: peer,
            from_peer_id: self.local,
            envelope: frame,
        })
    }

    /// Handle a bridge-related frame from `from`, received on a direct link
    /// or through relayed unicast
    pub fn handle_frame(&self, from: PeerId, frame: PeerFrame) -> BridgeHandled {
        match frame {
            PeerFrame::Bridge(envelope) => self.handle_envelope(from, envelope),
            PeerFrame::BridgeAck {
                message_id,
                origin,
                recipient,
            } => {
                if origin == self.local {
                    self.resolve((message_id, recipient), Reply::Ack);
                } else {
                    self.send_toward(
                        origin,
                        PeerFrame::BridgeAck {
                            message_id,
                            origin,
                            recipient,
                        },
                    );
                }
                BridgeHandled::Acknowledged
            }
            PeerFrame::BridgeNack {
                message_id,
                origin,
                recipient,
                reason,
            } => {
                if origin == self.local {
                    self.resolve((message_id, recipient), Reply::Nack(reason));
                } else {
                    self.send_toward(
                        origin,
                        PeerFrame::BridgeNack {
                            message_id,
                            origin,
                            recipient,
                            reason,
                        },
                    );
                }
                BridgeHandled::Acknowledged
            }
            _ => BridgeHandled::Ignored,
        }
    }

    fn resolve(&self, key: PendingKey, reply: Reply) {
        match self.pending().remove(&key) {
            Some(waiting) => {
                let _ = waiting.send(reply);
            }
            None => debug!("Late bridge reply for {}", key.0),
        }
    }

    fn handle_envelope(&self, from: PeerId, envelope: BridgeEnvelope) -> BridgeHandled {
        let recipient = envelope.final_recipient;
        let direct = self.mesh.is_usable(recipient);
        let relay_up = self.relay.is_connected();
        let previous = envelope.previous_hop(self.local);
        if previous != from {
            debug!(
                "Envelope {} from {} names {} as previous hop",
                envelope.message_id(),
                from.short(),
                previous.short()
            );
        }

        match next_step(&envelope, self.local, &self.config, direct, relay_up) {
            BridgeStep::Deliver => {
                self.send_toward(
                    previous,
                    PeerFrame::BridgeAck {
                        message_id: envelope.message_id(),
                        origin: envelope.origin,
                        recipient,
                    },
                );
                BridgeHandled::Deliver(envelope.message)
            }
            BridgeStep::ForwardDirect(next) => {
                let message_id = next.message_id();
                if self.mesh.send_frame(recipient, PeerFrame::Bridge(next)) {
                    debug!("Forwarded {} to {} directly", message_id, recipient.short());
                    BridgeHandled::Forwarded
                } else {
                    self.reject(&envelope, NackReason::Unreachable)
                }
            }
            BridgeStep::ForwardRelayed(next) => {
                let message_id = next.message_id();
                let sent = self.relay.send(SignalingMessage::Relay {
                    target_peer_id: recipient,
                    from_peer_id: self.local,
                    envelope: PeerFrame::Bridge(next),
                });
                if sent {
                    debug!("Forwarded {} to {} via relay", message_id, recipient.short());
                    BridgeHandled::Forwarded
                } else {
                    self.reject(&envelope, NackReason::Unreachable)
                }
            }
            BridgeStep::Reject(reason) => self.reject(&envelope, reason),
        }
    }

    fn reject(&self, envelope: &BridgeEnvelope, reason: NackReason) -> BridgeHandled {
        warn!(
            "Refusing to bridge {} for {}: {:?}",
            envelope.message_id(),
            envelope.origin.short(),
            reason
        );
        self.send_toward(
            envelope.previous_hop(self.local),
            PeerFrame::BridgeNack {
                message_id: envelope.message_id(),
                origin: envelope.origin,
                recipient: envelope.final_recipient,
                reason,
            },
        );
        BridgeHandled::Rejected(reason)
    }
}
