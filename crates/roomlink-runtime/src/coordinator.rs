//! Room Coordinator
//!
//! Server-side room registry. Every relayed connection registers here and
//! receives an outbound channel; join, leave, broadcast and unicast all fan
//! out through those channels. Membership changes happen under one lock so a
//! replacement join evicts the older connection before the new one is
//! admitted.

use dashmap::DashMap;
use roomlink_core::{
    config::CoordinatorConfig,
    protocol::{error_codes, leave_reasons, PeerInfo},
    ChatMessage, ConnectionId, PeerId, RoomId, RoomlinkError, RoomlinkResult, SignalingMessage,
    TimeSource, Timestamp,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound half handed to whoever pumps a relayed connection
pub type SignalingSender = mpsc::UnboundedSender<SignalingMessage>;
pub type SignalingReceiver = mpsc::UnboundedReceiver<SignalingMessage>;

// ----------------------------------------------------------------------------
// Registry State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct RelayedConnection {
    sender: SignalingSender,
    peer: Option<(PeerId, RoomId)>,
    connected_at: Timestamp,
    last_activity: Timestamp,
    probe_sent_at: Option<Timestamp>,
}

#[derive(Debug, Clone)]
struct Participant {
    display_name: String,
    connection_id: ConnectionId,
    joined_at: Timestamp,
    direct_links: HashSet<PeerId>,
}

#[derive(Debug)]
struct Room {
    participants: HashMap<PeerId, Participant>,
    created_at: Timestamp,
}

#[derive(Debug, Default)]
struct Membership {
    rooms: HashMap<RoomId, Room>,
    /// Room each joined peer currently sits in
    peers: HashMap<PeerId, RoomId>,
}

/// Read-only view of one room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub participants: Vec<PeerInfo>,
    pub created_at: Timestamp,
}

/// Read-only view of one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub peer_id: PeerId,
    pub display_name: String,
    pub room_id: RoomId,
    pub connection_id: ConnectionId,
    pub joined_at: Timestamp,
    pub direct_links: Vec<PeerId>,
}

/// Liveness bookkeeping for one relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionActivity {
    pub connection_id: ConnectionId,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
    pub probe_sent_at: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Room Coordinator
// ----------------------------------------------------------------------------

/// Authoritative registry of rooms, participants and relayed connections
pub struct RoomCoordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn TimeSource>,
    next_connection: AtomicU64,
    connections: DashMap<ConnectionId, RelayedConnection>,
    membership: Mutex<Membership>,
}

impl std::fmt::Debug for RoomCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomCoordinator")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl RoomCoordinator {
    pub fn new(config: CoordinatorConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            config,
            clock,
            next_connection: AtomicU64::new(1),
            connections: DashMap::new(),
            membership: Mutex::new(Membership::default()),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn membership(&self) -> MutexGuard<'_, Membership> {
        self.membership
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a freshly accepted relayed connection
    pub fn register_connection(&self) -> (ConnectionId, SignalingReceiver) {
        let id = ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        let now = self.now();
        self.connections.insert(
            id,
            RelayedConnection {
                sender,
                peer: None,
                connected_at: now,
                last_activity: now,
                probe_sent_at: None,
            },
        );
        debug!("Registered relayed connection {}", id);
        (id, receiver)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a message on one connection; false if it is gone
    pub fn send_to(&self, connection_id: ConnectionId, message: SignalingMessage) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => connection.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Record inbound activity, clearing any outstanding liveness probe
    pub fn touch(&self, connection_id: ConnectionId) {
        let now = self.now();
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.last_activity = now;
            connection.probe_sent_at = None;
        }
    }

    fn peer_of(&self, connection_id: ConnectionId) -> Option<(PeerId, RoomId)> {
        self.connections
            .get(&connection_id)
            .and_then(|connection| connection.peer.clone())
    }

    fn set_peer(&self, connection_id: ConnectionId, peer: Option<(PeerId, RoomId)>) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.peer = peer;
        }
    }

    /// Send to every participant of `room` except `skip`
    fn fan_out(&self, room: &Room, skip: Option<PeerId>, message: &SignalingMessage) -> usize {
        let mut delivered = 0;
        for (peer_id, participant) in &room.participants {
            if Some(*peer_id) == skip {
                continue;
            }
            if self.send_to(participant.connection_id, message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove `peer_id` from its room and announce the departure
    fn remove_participant(
        &self,
        membership: &mut Membership,
        peer_id: PeerId,
        reason: &str,
    ) -> Option<Participant> {
        let room_id = membership.peers.remove(&peer_id)?;
        let room = membership.rooms.get_mut(&room_id)?;
        let participant = room.participants.remove(&peer_id)?;
        for other in room.participants.values_mut() {
            other.direct_links.remove(&peer_id);
        }

        let notice = SignalingMessage::PeerLeft {
            peer_id,
            display_name: participant.display_name.clone(),
            reason: reason.to_string(),
        };
        self.fan_out(room, Some(peer_id), &notice);
        info!(
            "Peer {} left room {} ({})",
            peer_id.short(),
            room_id,
            reason
        );

        if room.participants.is_empty() {
            membership.rooms.remove(&room_id);
            debug!("Room {} is empty, removed", room_id);
        }
        Some(participant)
    }

    /// Admit `peer_id` to `room_id` over `connection_id` and return everyone
    /// else already present. A newer join for the same PeerId evicts the
    /// older connection first.
    pub fn join(
        &self,
        connection_id: ConnectionId,
        room_id: RoomId,
        peer_id: PeerId,
        display_name: &str,
    ) -> RoomlinkResult<Vec<PeerInfo>> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RoomlinkError::invalid_message("display name is empty"));
        }
        if display_name.chars().count() > self.config.max_display_name_len {
            return Err(RoomlinkError::invalid_message(format!(
                "display name exceeds {} characters",
                self.config.max_display_name_len
            )));
        }
        if !self.connections.contains_key(&connection_id) {
            return Err(RoomlinkError::channel_error(format!(
                "connection {connection_id} is closed"
            )));
        }

        let now = self.now();
        let mut membership = self.membership();

        // Same connection switching rooms leaves the old one cleanly
        if let Some((previous_peer, _)) = self.peer_of(connection_id) {
            self.remove_participant(&mut membership, previous_peer, leave_reasons::LEFT);
            self.set_peer(connection_id, None);
        }

        // Last join wins: evict the stale connection for this identity
        let stale_connection = membership.peers.get(&peer_id).and_then(|room| {
            membership
                .rooms
                .get(room)
                .and_then(|room| room.participants.get(&peer_id))
                .map(|participant| participant.connection_id)
        });
        if let Some(stale) = stale_connection.filter(|stale| *stale != connection_id) {
            self.remove_participant(&mut membership, peer_id, leave_reasons::REPLACED);
            if self.connections.remove(&stale).is_some() {
                info!(
                    "Closed connection {} replaced by {} for peer {}",
                    stale,
                    connection_id,
                    peer_id.short()
                );
            }
        }

        let room = membership.rooms.entry(room_id.clone()).or_insert_with(|| Room {
            participants: HashMap::new(),
            created_at: now,
        });
        if room.participants.len() >= self.config.max_room_participants {
            if room.participants.is_empty() {
                membership.rooms.remove(&room_id);
            }
            return Err(RoomlinkError::RoomFull {
                room_id: room_id.to_string(),
                limit: self.config.max_room_participants,
            });
        }

        let mut roster: Vec<PeerInfo> = room
            .participants
            .iter()
            .map(|(id, participant)| PeerInfo {
                peer_id: *id,
                display_name: participant.display_name.clone(),
            })
            .collect();
        roster.sort_by_key(|info| info.peer_id);

        let notice = SignalingMessage::PeerJoined {
            peer_id,
            display_name: display_name.to_string(),
        };
        self.fan_out(room, Some(peer_id), &notice);

        room.participants.insert(
            peer_id,
            Participant {
                display_name: display_name.to_string(),
                connection_id,
                joined_at: now,
                direct_links: HashSet::new(),
            },
        );
        membership.peers.insert(peer_id, room_id.clone());
        self.set_peer(connection_id, Some((peer_id, room_id.clone())));

        info!(
            "Peer {} ({}) joined room {} with {} others",
            peer_id.short(),
            display_name,
            room_id,
            roster.len()
        );
        Ok(roster)
    }

    /// Remove `peer_id` from its room; false if it was not joined
    pub fn leave(&self, peer_id: PeerId) -> bool {
        let mut membership = self.membership();
        match self.remove_participant(&mut membership, peer_id, leave_reasons::LEFT) {
            Some(participant) => {
                self.set_peer(participant.connection_id, None);
                true
            }
            None => false,
        }
    }

    /// Deliver a chat message to every participant of the room, sender
    /// included, stamped with the delivery time; the sender also gets a
    /// delivery acknowledgement
    pub fn broadcast(&self, room_id: &RoomId, message: ChatMessage) -> RoomlinkResult<usize> {
        message.validate(self.config.max_message_len)?;

        let mut message = message;
        let now = self.now();
        let delivered_at = if now > message.sent_at {
            now
        } else {
            message.sent_at
        };
        message.delivered_at = Some(delivered_at);
        message.hop_count = 0;

        let membership = self.membership();
        let room = membership
            .rooms
            .get(room_id)
            .ok_or_else(|| RoomlinkError::invalid_message(format!("room {room_id} not found")))?;

        let sender = message.sender;
        let message_id = message.id;
        let delivered = self.fan_out(
            room,
            None,
            &SignalingMessage::ChatMessage {
                room_id: room_id.clone(),
                message,
            },
        );
        if let Some(participant) = room.participants.get(&sender) {
            self.send_to(
                participant.connection_id,
                SignalingMessage::DeliveryAck {
                    message_id,
                    delivered_at,
                },
            );
        }
        debug!(
            "Broadcast {} in room {} to {} participants",
            message_id, room_id, delivered
        );
        Ok(delivered)
    }

    /// Route a payload to exactly one participant, in any room
    pub fn unicast(&self, target: PeerId, payload: SignalingMessage) -> RoomlinkResult<()> {
        let connection_id = {
            let membership = self.membership();
            membership
                .peers
                .get(&target)
                .and_then(|room| membership.rooms.get(room))
                .and_then(|room| room.participants.get(&target))
                .map(|participant| participant.connection_id)
        };
        match connection_id {
            Some(connection_id) if self.send_to(connection_id, payload) => Ok(()),
            _ => Err(RoomlinkError::peer_unavailable(target)),
        }
    }

    /// Dispatch one inbound message from a relayed connection
    pub fn handle_message(&self, connection_id: ConnectionId, message: SignalingMessage) {
        self.touch(connection_id);
        let kind = message.kind();

        match message {
            SignalingMessage::JoinRoom {
                room_id,
                peer_id,
                display_name,
            } => match self.join(connection_id, room_id.clone(), peer_id, &display_name) {
                Ok(peers) => {
                    self.send_to(connection_id, SignalingMessage::Roster { room_id, peers });
                }
                Err(e) => {
                    let code = match e {
                        RoomlinkError::RoomFull { .. } => error_codes::ROOM_FULL,
                        _ => error_codes::INVALID_MESSAGE,
                    };
                    self.send_to(connection_id, SignalingMessage::error(code, e.to_string()));
                }
            },

            SignalingMessage::LeaveRoom => {
                if let Some((peer_id, _)) = self.peer_of(connection_id) {
                    self.leave(peer_id);
                }
            }

            SignalingMessage::ChatMessage { room_id, message } => {
                let joined = self.peer_of(connection_id);
                let authorized = joined
                    .as_ref()
                    .is_some_and(|(peer, room)| *peer == message.sender && *room == room_id);
                if !authorized {
                    self.send_to(
                        connection_id,
                        SignalingMessage::error(
                            error_codes::NOT_JOINED,
                            format!("not a participant of room {room_id}"),
                        ),
                    );
                    return;
                }
                if let Err(e) = self.broadcast(&room_id, message) {
                    self.send_to(
                        connection_id,
                        SignalingMessage::error(error_codes::INVALID_MESSAGE, e.to_string()),
                    );
                }
            }

            forward @ (SignalingMessage::RequestConnection { .. }
            | SignalingMessage::ConnectionResponse { .. }
            | SignalingMessage::Relay { .. }) => {
                if self.peer_of(connection_id).is_none() {
                    self.send_to(
                        connection_id,
                        SignalingMessage::error(error_codes::NOT_JOINED, "join a room first"),
                    );
                    return;
                }
                self.forward_unicast(connection_id, forward);
            }

            SignalingMessage::HealthPing { timestamp } => {
                self.send_to(
                    connection_id,
                    SignalingMessage::HealthPong {
                        timestamp: self.now(),
                        original_timestamp: timestamp,
                    },
                );
            }

            SignalingMessage::HealthPong { .. } => {}

            SignalingMessage::Presence { record } => {
                let Some((peer_id, room_id)) = self.peer_of(connection_id) else {
                    return;
                };
                if record.peer_id != peer_id || record.room_id != room_id {
                    warn!(
                        "Dropping presence for {} from connection {}",
                        record.peer_id.short(),
                        connection_id
                    );
                    return;
                }
                let mut membership = self.membership();
                if let Some(room) = membership.rooms.get_mut(&room_id) {
                    if let Some(participant) = room.participants.get_mut(&peer_id) {
                        participant.direct_links =
                            record.links.iter().map(|link| link.peer_id).collect();
                    }
                    self.fan_out(room, Some(peer_id), &SignalingMessage::Presence { record });
                }
            }

            SignalingMessage::Roster { .. }
            | SignalingMessage::PeerJoined { .. }
            | SignalingMessage::PeerLeft { .. }
            | SignalingMessage::DeliveryAck { .. }
            | SignalingMessage::Error { .. } => {
                debug!(
                    "Ignoring server-only message {} from connection {}",
                    kind, connection_id
                );
            }
        }
    }

    fn forward_unicast(&self, connection_id: ConnectionId, payload: SignalingMessage) {
        let target = match &payload {
            SignalingMessage::RequestConnection { target_peer_id, .. }
            | SignalingMessage::ConnectionResponse { target_peer_id, .. }
            | SignalingMessage::Relay { target_peer_id, .. } => *target_peer_id,
            _ => return,
        };
        let kind = payload.kind();
        if let Err(e) = self.unicast(target, payload) {
            debug!("Unicast {} to {} failed: {}", kind, target.short(), e);
            self.send_to(
                connection_id,
                SignalingMessage::error(error_codes::PEER_NOT_FOUND, target.to_string()),
            );
        }
    }

    /// Connection closed by the transport
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.close_connection(connection_id, leave_reasons::DISCONNECTED);
    }

    /// Close a connection from the server side, announcing `reason`
    pub fn force_close(&self, connection_id: ConnectionId, reason: &str) {
        self.close_connection(connection_id, reason);
    }

    fn close_connection(&self, connection_id: ConnectionId, reason: &str) {
        let Some((_, connection)) = self.connections.remove(&connection_id) else {
            return;
        };
        if let Some((peer_id, _)) = connection.peer {
            let mut membership = self.membership();
            // Only evict if the membership still belongs to this connection
            let owned = membership
                .peers
                .get(&peer_id)
                .and_then(|room| membership.rooms.get(room))
                .and_then(|room| room.participants.get(&peer_id))
                .is_some_and(|participant| participant.connection_id == connection_id);
            if owned {
                self.remove_participant(&mut membership, peer_id, reason);
            }
        }
        debug!("Relayed connection {} closed ({})", connection_id, reason);
    }

    /// Mark a liveness probe as sent and push a health ping
    pub fn send_probe(&self, connection_id: ConnectionId) -> bool {
        let now = self.now();
        match self.connections.get_mut(&connection_id) {
            Some(mut connection) => {
                connection.probe_sent_at = Some(now);
                connection
                    .sender
                    .send(SignalingMessage::HealthPing { timestamp: now })
                    .is_ok()
            }
            None => false,
        }
    }

    pub fn activity(&self) -> Vec<ConnectionActivity> {
        self.connections
            .iter()
            .map(|entry| ConnectionActivity {
                connection_id: *entry.key(),
                connected_at: entry.connected_at,
                last_activity: entry.last_activity,
                probe_sent_at: entry.probe_sent_at,
            })
            .collect()
    }

    pub fn rooms(&self) -> Vec<RoomSnapshot> {
        let membership = self.membership();
        let mut rooms: Vec<RoomSnapshot> = membership
            .rooms
            .iter()
            .map(|(room_id, room)| {
                let mut participants: Vec<PeerInfo> = room
                    .participants
                    .iter()
                    .map(|(peer_id, participant)| PeerInfo {
                        peer_id: *peer_id,
                        display_name: participant.display_name.clone(),
                    })
                    .collect();
                participants.sort_by_key(|info| info.peer_id);
                RoomSnapshot {
                    room_id: room_id.clone(),
                    participants,
                    created_at: room.created_at,
                }
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.as_str().cmp(b.room_id.as_str()));
        rooms
    }

    pub fn room(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        self.rooms().into_iter().find(|room| &room.room_id == room_id)
    }

    pub fn participant(&self, peer_id: PeerId) -> Option<ParticipantSnapshot> {
        let membership = self.membership();
        let room_id = membership.peers.get(&peer_id)?;
        let participant = membership.rooms.get(room_id)?.participants.get(&peer_id)?;
        let mut direct_links: Vec<PeerId> = participant.direct_links.iter().copied().collect();
        direct_links.sort();
        Some(ParticipantSnapshot {
            peer_id,
            display_name: participant.display_name.clone(),
            room_id: room_id.clone(),
            connection_id: participant.connection_id,
            joined_at: participant.joined_at,
            direct_links,
        })
    }
}
