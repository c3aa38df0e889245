//! Hybrid Router
//!
//! Picks a path per recipient for every outbound message and filters inbound
//! copies. A message sent over several paths is delivered to the
//! application once per room: inbound copies are deduplicated on the
//! (sender, message id) fingerprint.
//!
//! Relayed delivery is a single coordinator broadcast shared by every
//! recipient routed that way. The broadcast echoes back to us, and that echo
//! (or the coordinator's delivery ack, whichever comes first) confirms the
//! message. Messages sent only over direct links are confirmed as soon as
//! the frames are handed to the links. Our own messages are held here until
//! confirmed so the caller can persist exactly what was delivered.

use roomlink_core::{
    config::RoomlinkConfig, ChatMessage, DropReason, InboundPath, MessageId, OutboundQueue,
    PeerFrame, PeerId, RelayHealth, RoomDedup, RoomId, Route, RoutePolicy, RouteReport,
    RoutingStats, SignalingMessage, TimeSource, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::mesh::MeshUpgradeManager;
use crate::relay::RelayHandle;

/// One intended recipient of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub peer_id: PeerId,
    /// Recipient's self-reported relayed-connection quality, if known
    pub relay_quality: Option<u8>,
}

/// Result of dispatching one outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub report: RouteReport,
    /// Recipients handed to the bridge
    pub bridged: Vec<PeerId>,
    /// Set when every copy went over direct links
    pub delivered_at: Option<Timestamp>,
    /// Messages evicted from a full queue to make room
    pub evicted: Vec<MessageId>,
}

/// What an inbound copy turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// First copy of someone else's message
    New(ChatMessage),
    /// Relayed echo of one of our messages; `confirmed` carries the message
    /// on its first confirmation only
    Echo {
        message_id: MessageId,
        delivered_at: Timestamp,
        confirmed: Option<ChatMessage>,
    },
    Duplicate,
}

/// Outcome of a queue flush
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    pub sent: usize,
    /// Flushed over direct links only, so already confirmed
    pub delivered: Vec<ChatMessage>,
    pub dropped: Vec<(MessageId, DropReason)>,
}

// ----------------------------------------------------------------------------
// Hybrid Router
// ----------------------------------------------------------------------------

pub struct HybridRouter {
    local: PeerId,
    policy: RoutePolicy,
    dedup: RoomDedup,
    stats: RoutingStats,
    queue: OutboundQueue,
    relay_health: RelayHealth,
    mesh: MeshUpgradeManager,
    relay: RelayHandle,
    clock: Arc<dyn TimeSource>,
    unconfirmed: HashMap<MessageId, ChatMessage>,
}

impl HybridRouter {
    pub fn new(
        local: PeerId,
        config: &RoomlinkConfig,
        mesh: MeshUpgradeManager,
        relay: RelayHandle,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            local,
            policy: RoutePolicy::new(&config.router, &config.bridge),
            dedup: RoomDedup::new(config.router.dedup_window),
            stats: RoutingStats::default(),
            queue: OutboundQueue::new(config.queue.clone()),
            relay_health: RelayHealth::Down,
            mesh,
            relay,
            clock,
            unconfirmed: HashMap::new(),
        }
    }

    pub fn set_relay_health(&mut self, health: RelayHealth) {
        if health != self.relay_health {
            info!("Relayed channel {:?} -> {:?}", self.relay_health, health);
        }
        self.relay_health = health;
    }

    pub fn relay_health(&self) -> RelayHealth {
        self.relay_health
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn record_relay_exhausted(&mut self) {
        self.stats.relay_exhausted += 1;
    }

    pub fn record_bridged_for_others(&mut self) {
        self.stats.bridged_for_others += 1;
    }

    /// Path the policy would pick for `recipient` right now
    pub fn route_for(&self, recipient: &Recipient) -> Route {
        self.policy.select(
            self.mesh.direct_path(recipient.peer_id),
            self.relay_health,
            recipient.relay_quality,
        )
    }

    fn broadcast(&mut self, message: &ChatMessage) -> bool {
        if self.relay_health == RelayHealth::Down {
            return false;
        }
        let sent = self.relay.send(SignalingMessage::ChatMessage {
            room_id: message.room_id.clone(),
            message: message.clone(),
        });
        if sent {
            self.stats.record_sent(Route::Relayed);
        }
        sent
    }

    fn enqueue(&mut self, message: ChatMessage, evicted: &mut Vec<MessageId>) {
        debug!("Queueing message {} until a path opens", message.id);
        self.stats.record_sent(Route::Queue);
        if let Some(dropped) = self.queue.push(message, self.clock.now()) {
            self.stats.dropped_from_queue += 1;
            self.unconfirmed.remove(&dropped.message.id);
            evicted.push(dropped.message.id);
        }
    }

    /// Dispatch `message` to `recipients`, picking a path for each
    pub fn send(&mut self, message: ChatMessage, recipients: &[Recipient]) -> Dispatch {
        let mut report = RouteReport::new(message.id);
        let mut bridged = Vec::new();
        let mut evicted = Vec::new();
        self.unconfirmed.insert(message.id, message.clone());

        // Alone in the room: the relayed echo is the only confirmation
        if recipients.is_empty() {
            if self.broadcast(&message) {
                report.relayed_broadcast = true;
            } else {
                self.enqueue(message, &mut evicted);
                report.queued = true;
            }
            return Dispatch {
                report,
                bridged,
                delivered_at: None,
                evicted,
            };
        }

        let mut wants_broadcast = false;
        let mut wants_queue = false;
        for recipient in recipients {
            let mut route = self.route_for(recipient);
            if route == Route::Direct {
                if self
                    .mesh
                    .send_frame(recipient.peer_id, PeerFrame::Chat(message.clone()))
                {
                    self.stats.record_sent(Route::Direct);
                } else {
                    route = self.policy.bridge_fallback(None, self.relay_health);
                }
            }
            match route {
                Route::Direct => {}
                Route::Relayed => wants_broadcast = true,
                Route::Bridge => bridged.push(recipient.peer_id),
                Route::Queue => wants_queue = true,
            }
            report.routes.push((recipient.peer_id, route));
        }

        if wants_broadcast {
            if self.broadcast(&message) {
                report.relayed_broadcast = true;
            } else {
                for (_, route) in report.routes.iter_mut() {
                    if *route == Route::Relayed {
                        *route = Route::Queue;
                    }
                }
                wants_queue = true;
            }
        }
        self.stats.sent_bridged += bridged.len() as u64;

        if wants_queue {
            self.enqueue(message.clone(), &mut evicted);
            report.queued = true;
        }

        let delivered_at = (report.count(Route::Direct) == report.routes.len())
            .then(|| self.clock.now());
        if delivered_at.is_some() {
            self.unconfirmed.remove(&message.id);
        }
        debug!(
            "Routed {}: {} direct, {} relayed, {} bridged, queued {}",
            message.id,
            report.count(Route::Direct),
            report.count(Route::Relayed),
            bridged.len(),
            report.queued
        );

        Dispatch {
            report,
            bridged,
            delivered_at,
            evicted,
        }
    }

    /// Path for a recipient the bridge gave up on
    pub fn bridge_exhausted(&mut self, message: ChatMessage, recipient: PeerId) -> (Route, Vec<MessageId>) {
        self.record_relay_exhausted();
        let mut evicted = Vec::new();
        let direct = self.mesh.direct_path(recipient);
        let route = match self.policy.bridge_fallback(direct, self.relay_health) {
            Route::Relayed if self.broadcast(&message) => Route::Relayed,
            Route::Direct
                if self
                    .mesh
                    .send_frame(recipient, PeerFrame::Chat(message.clone())) =>
            {
                self.stats.record_sent(Route::Direct);
                Route::Direct
            }
            _ => {
                self.enqueue(message, &mut evicted);
                Route::Queue
            }
        };
        info!("Bridge exhausted for {}, fell back to {:?}", recipient.short(), route);
        (route, evicted)
    }

    /// Mark one of our messages confirmed; yields it the first time only
    pub fn confirm(&mut self, message_id: MessageId, delivered_at: Timestamp) -> Option<ChatMessage> {
        let mut message = self.unconfirmed.remove(&message_id)?;
        message.delivered_at.get_or_insert(delivered_at);
        Some(message)
    }

    /// Filter an inbound copy of a chat message
    pub fn on_receive(&mut self, message: ChatMessage, path: InboundPath) -> Received {
        if message.sender == self.local {
            let delivered_at = message.delivered_at.unwrap_or_else(|| self.clock.now());
            return Received::Echo {
                message_id: message.id,
                delivered_at,
                confirmed: self.confirm(message.id, delivered_at),
            };
        }
        if !self
            .dedup
            .check_and_insert(&message.room_id, message.fingerprint())
        {
            self.stats.duplicates_filtered += 1;
            return Received::Duplicate;
        }
        self.stats.record_received(path);
        Received::New(message)
    }

    /// Retry queued messages: relayed broadcast when the relay is up,
    /// otherwise every established direct link
    pub fn flush_queue(&mut self) -> FlushReport {
        if self.queue.is_empty() {
            return FlushReport::default();
        }
        let now = self.clock.now();
        let relay_up = self.relay_health != RelayHealth::Down;
        let Self {
            queue,
            mesh,
            relay,
            stats,
            ..
        } = self;
        let mut delivered = Vec::new();
        let peers: Vec<PeerId> = mesh
            .snapshot()
            .into_iter()
            .filter(|row| row.state.is_established())
            .map(|row| row.peer_id)
            .collect();

        let outcome = queue.flush(now, |message| {
            if relay_up
                && relay.send(SignalingMessage::ChatMessage {
                    room_id: message.room_id.clone(),
                    message: message.clone(),
                })
            {
                stats.record_sent(Route::Relayed);
                return true;
            }
            let mut any = false;
            for peer in &peers {
                if mesh.send_frame(*peer, PeerFrame::Chat(message.clone())) {
                    stats.record_sent(Route::Direct);
                    any = true;
                }
            }
            if any {
                delivered.push(message.clone());
            }
            any
        });

        let delivered: Vec<ChatMessage> = delivered
            .into_iter()
            .map(|message| {
                let mut message = self.unconfirmed.remove(&message.id).unwrap_or(message);
                message.delivered_at = Some(now);
                message
            })
            .collect();
        let dropped: Vec<(MessageId, DropReason)> = outcome
            .dropped
            .into_iter()
            .map(|(entry, reason)| (entry.message.id, reason))
            .collect();
        for (id, _) in &dropped {
            self.unconfirmed.remove(id);
        }
        self.stats.dropped_from_queue += dropped.len() as u64;
        if outcome.sent > 0 {
            info!("Flushed {} queued messages", outcome.sent);
        }
        FlushReport {
            sent: outcome.sent,
            delivered,
            dropped,
        }
    }

    pub fn forget_room(&mut self, room_id: &RoomId) {
        self.dedup.forget_room(room_id);
    }
}
