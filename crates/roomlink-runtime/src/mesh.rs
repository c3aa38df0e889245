//! Mesh Upgrade Manager
//!
//! Negotiates direct links over the relayed channel and keeps them healthy.
//! Every attempt, outgoing or incoming, first claims the pair in the
//! [`LinkTable`] under the state lock, so concurrent attempts to the same
//! peer collapse into one. Crossing requests are resolved by PeerId order:
//! the smaller id keeps dialing and the larger one becomes the responder.
//!
//! Outgoing attempts are capped by a semaphore and bounded by
//! `attempt_timeout`. Links that drop after staying open for
//! `min_stable_duration` are retried with backoff; short-lived ones are not.

use roomlink_core::{
    config::{CircuitBreakerConfig, MeshConfig, QualityConfig},
    CircuitBreaker, CrossingDecision, DirectLinkState, DirectPath, LinkQuality, LinkReport,
    LinkRole, LinkTable, NetworkCondition, PeerFrame, PeerId, QualityVerdict, RoomId,
    RoomlinkError, RoomlinkResult, SignalingMessage, TimeSource, Timestamp,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::direct::{DirectLink, DirectTransport};
use crate::relay::RelayHandle;

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Lifecycle notifications for the client loop
#[derive(Debug)]
pub enum MeshEvent {
    LinkOpened { peer_id: PeerId, role: LinkRole },
    LinkClosed {
        peer_id: PeerId,
        open_for: Option<std::time::Duration>,
        reconnecting: bool,
    },
    AttemptFailed { peer_id: PeerId, error: RoomlinkError },
    /// Probing moved an open link to `Degraded`; it stays up
    LinkDegraded { peer_id: PeerId, error: RoomlinkError },
}

/// Traffic from an open link's reader task
#[derive(Debug)]
pub enum LinkActivity {
    Frame { peer_id: PeerId, frame: PeerFrame },
    Closed { peer_id: PeerId, generation: u64 },
}

/// Tier or state change of one link after a probe round
#[derive(Debug, Clone, PartialEq)]
pub struct QualityChange {
    pub peer_id: PeerId,
    pub condition: NetworkCondition,
    pub degraded: bool,
}

/// Row in a link snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub peer_id: PeerId,
    pub state: DirectLinkState,
    pub condition: Option<NetworkCondition>,
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Answer {
    accepted: bool,
    address: Option<String>,
}

enum Negotiated {
    Link(DirectLink),
    Declined,
}

struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<PeerFrame>,
    quality: LinkQuality,
    probes: HashMap<u64, Instant>,
    reader: JoinHandle<()>,
}

struct MeshState {
    table: LinkTable,
    links: HashMap<PeerId, ActiveLink>,
    answers: HashMap<PeerId, oneshot::Sender<RoomlinkResult<Answer>>>,
    outcomes: HashMap<PeerId, watch::Sender<Option<bool>>>,
    breakers: HashMap<PeerId, CircuitBreaker>,
    next_nonce: u64,
    next_generation: u64,
}

struct MeshShared {
    local: PeerId,
    config: MeshConfig,
    quality: QualityConfig,
    breaker: CircuitBreakerConfig,
    clock: Arc<dyn TimeSource>,
    transport: Arc<dyn DirectTransport>,
    relay: RelayHandle,
    events: mpsc::UnboundedSender<MeshEvent>,
    activity: mpsc::UnboundedSender<LinkActivity>,
    permits: Semaphore,
    room: Mutex<Option<RoomId>>,
    state: Mutex<MeshState>,
}

// ----------------------------------------------------------------------------
// Mesh Upgrade Manager
// ----------------------------------------------------------------------------

/// Cheap-to-clone handle; clones share one link table
#[derive(Clone)]
pub struct MeshUpgradeManager {
    inner: Arc<MeshShared>,
}

impl std::fmt::Debug for MeshUpgradeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshUpgradeManager")
            .field("local", &self.inner.local)
            .finish()
    }
}

/// Builder inputs for [`MeshUpgradeManager::new`]
pub struct MeshSettings {
    pub mesh: MeshConfig,
    pub quality: QualityConfig,
    pub breaker: CircuitBreakerConfig,
}

impl MeshUpgradeManager {
    pub fn new(
        local: PeerId,
        settings: MeshSettings,
        clock: Arc<dyn TimeSource>,
        transport: Arc<dyn DirectTransport>,
        relay: RelayHandle,
        events: mpsc::UnboundedSender<MeshEvent>,
        activity: mpsc::UnboundedSender<LinkActivity>,
    ) -> Self {
        let permits = Semaphore::new(settings.mesh.max_pending_attempts.max(1));
        Self {
            inner: Arc::new(MeshShared {
                local,
                config: settings.mesh,
                quality: settings.quality,
                breaker: settings.breaker,
                clock,
                transport,
                relay,
                events,
                activity,
                permits,
                room: Mutex::new(None),
                state: Mutex::new(MeshState {
                    table: LinkTable::new(local),
                    links: HashMap::new(),
                    answers: HashMap::new(),
                    outcomes: HashMap::new(),
                    breakers: HashMap::new(),
                    next_nonce: 1,
                    next_generation: 1,
                }),
            }),
        }
    }

    pub fn local(&self) -> PeerId {
        self.inner.local
    }

    fn state(&self) -> MutexGuard<'_, MeshState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn room(&self) -> Option<RoomId> {
        self.inner
            .room
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Room direct links are negotiated for; `None` tears everything down
    pub fn set_room(&self, room: Option<RoomId>) {
        if room.is_none() {
            self.close_all("left room");
        }
        *self
            .inner
            .room
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = room;
    }

    fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.inner.events.send(event);
    }

    fn settle(state: &mut MeshState, target: PeerId, opened: bool) {
        if let Some(outcome) = state.outcomes.remove(&target) {
            outcome.send_replace(Some(opened));
        }
    }

    async fn await_outcome(&self, mut outcome: watch::Receiver<Option<bool>>) -> bool {
        let wait = async {
            loop {
                let current = *outcome.borrow();
                if let Some(opened) = current {
                    return opened;
                }
                if outcome.changed().await.is_err() {
                    return (*outcome.borrow()).unwrap_or(false);
                }
            }
        };
        timeout(self.inner.config.attempt_timeout * 2, wait)
            .await
            .unwrap_or(false)
    }

    fn subscribe(&self, state: &mut MeshState, target: PeerId) -> watch::Receiver<Option<bool>> {
        state
            .outcomes
            .entry(target)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    // ------------------------------------------------------------------------
    // Outgoing attempts
    // ------------------------------------------------------------------------

    /// Try to open a direct link to `target`. Returns once the link is open
    /// or the attempt has failed; a concurrent attempt to the same peer is
    /// joined rather than duplicated.
    pub async fn attempt_upgrade(&self, target: PeerId) -> bool {
        if target == self.inner.local {
            return false;
        }
        let Some(room) = self.room() else {
            return false;
        };
        let now = self.now();

        let pending = {
            let mut state = self.state();
            match state.table.state(target).cloned() {
                Some(current) if current.is_established() => return true,
                Some(DirectLinkState::Pending { .. }) => Some(self.subscribe(&mut state, target)),
                _ => {
                    if state.table.established_count() >= self.inner.config.max_direct_links {
                        debug!("Direct link limit reached, not upgrading {}", target.short());
                        return false;
                    }
                    let breaker_config = self.inner.breaker.clone();
                    let breaker = state
                        .breakers
                        .entry(target)
                        .or_insert_with(|| CircuitBreaker::new(breaker_config));
                    if !breaker.allow_attempt(now) {
                        debug!("Breaker open for {}, skipping upgrade", target.short());
                        return false;
                    }
                    state.table.reserve(target, LinkRole::Dialer, now);
                    state
                        .outcomes
                        .insert(target, watch::channel(None).0);
                    None
                }
            }
        };
        if let Some(outcome) = pending {
            return self.await_outcome(outcome).await;
        }

        let Ok(_permit) = self.inner.permits.acquire().await else {
            self.fail(target, RoomlinkError::channel_error("upgrade permits closed"));
            return false;
        };

        // A crossing request may have turned us into the responder while we
        // waited for a permit
        let answer = {
            let mut state = self.state();
            match state.table.state(target).cloned() {
                Some(DirectLinkState::Pending {
                    role: LinkRole::Dialer,
                    ..
                }) => {
                    let (tx, rx) = oneshot::channel();
                    state.answers.insert(target, tx);
                    Ok(rx)
                }
                Some(DirectLinkState::Pending { .. }) => Err(Some(self.subscribe(&mut state, target))),
                Some(current) if current.is_established() => return true,
                _ => Err(None),
            }
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(Some(outcome)) => return self.await_outcome(outcome).await,
            Err(None) => return false,
        };

        let requested = self.inner.relay.send(SignalingMessage::RequestConnection {
            target_peer_id: target,
            from_peer_id: self.inner.local,
            address: self.inner.transport.address(),
        });
        if !requested {
            self.state().answers.remove(&target);
            self.fail(
                target,
                RoomlinkError::coordinator_unreachable("relayed channel down"),
            );
            return false;
        }
        debug!("Requested direct link to {}", target.short());

        let attempt_timeout = self.inner.config.attempt_timeout;
        let result = timeout(attempt_timeout, self.negotiate(target, &room, answer)).await;
        self.state().answers.remove(&target);

        match result {
            Ok(Ok(Negotiated::Link(link))) => self.install(target, link),
            Ok(Ok(Negotiated::Declined)) => match self.converted_outcome(target) {
                Some(outcome) => self.await_outcome(outcome).await,
                None => {
                    self.fail(target, RoomlinkError::duplicate_connection(target));
                    false
                }
            },
            Ok(Err(e)) => {
                self.fail(target, e);
                false
            }
            Err(_) => match self.converted_outcome(target) {
                Some(outcome) => self.await_outcome(outcome).await,
                None => {
                    self.fail(
                        target,
                        RoomlinkError::connection_timeout(target, attempt_timeout),
                    );
                    false
                }
            },
        }
    }

    async fn negotiate(
        &self,
        target: PeerId,
        room: &RoomId,
        answer: oneshot::Receiver<RoomlinkResult<Answer>>,
    ) -> RoomlinkResult<Negotiated> {
        let answer = answer
            .await
            .map_err(|_| RoomlinkError::channel_error("connection response dropped"))??;
        if !answer.accepted {
            return Ok(Negotiated::Declined);
        }
        let address = answer.address.ok_or_else(|| {
            RoomlinkError::invalid_message("accepted connection response without address")
        })?;
        let link = self
            .inner
            .transport
            .dial(self.inner.local, room, &address, target)
            .await?;
        Ok(Negotiated::Link(link))
    }

    /// Outcome to wait on if our entry was converted to responder
    fn converted_outcome(&self, target: PeerId) -> Option<watch::Receiver<Option<bool>>> {
        let mut state = self.state();
        let converted = matches!(
            state.table.state(target),
            Some(DirectLinkState::Pending {
                role: LinkRole::Responder,
                ..
            })
        );
        converted.then(|| self.subscribe(&mut state, target))
    }

    fn fail(&self, target: PeerId, error: RoomlinkError) {
        let now = self.now();
        {
            let mut state = self.state();
            if matches!(
                state.table.state(target),
                Some(DirectLinkState::Pending { .. })
            ) {
                let _ = state.table.mark_failed(target, error.to_string(), now);
            }
            if let Some(breaker) = state.breakers.get_mut(&target) {
                breaker.record_failure(now);
            }
            Self::settle(&mut state, target, false);
        }
        debug!("Upgrade to {} failed: {}", target.short(), error);
        self.emit(MeshEvent::AttemptFailed {
            peer_id: target,
            error,
        });
        self.schedule_reconnect(target);
    }

    /// Register an established transport for a pending entry
    fn install(&self, target: PeerId, link: DirectLink) -> bool {
        let now = self.now();
        let DirectLink {
            remote,
            outbound,
            mut inbound,
        } = link;

        let role = {
            let mut state = self.state();
            let pending_role = match state.table.state(target) {
                Some(DirectLinkState::Pending { role, .. }) => Some(*role),
                _ => None,
            };
            let Some(role) = pending_role else {
                drop(state);
                debug!("Discarding link to {} with no pending entry", target.short());
                let _ = outbound.send(PeerFrame::Close {
                    reason: "duplicate".into(),
                });
                return false;
            };
            if state.table.mark_open(target, now).is_err() {
                return false;
            }
            state.table.reset_reconnect(target);
            if let Some(breaker) = state.breakers.get_mut(&target) {
                breaker.record_success();
            }

            let generation = state.next_generation;
            state.next_generation += 1;
            let activity = self.inner.activity.clone();
            let reader = tokio::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    if activity
                        .send(LinkActivity::Frame {
                            peer_id: remote,
                            frame,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = activity.send(LinkActivity::Closed {
                    peer_id: remote,
                    generation,
                });
            });
            state.links.insert(
                target,
                ActiveLink {
                    generation,
                    outbound,
                    quality: LinkQuality::new(self.inner.quality.clone(), now),
                    probes: HashMap::new(),
                    reader,
                },
            );
            Self::settle(&mut state, target, true);
            role
        };

        info!(
            "Direct link {} <-> {} open ({:?})",
            self.inner.local.short(),
            target.short(),
            role
        );
        self.emit(MeshEvent::LinkOpened {
            peer_id: target,
            role,
        });
        true
    }

    fn schedule_reconnect(&self, target: PeerId) -> bool {
        let backoff = &self.inner.config.reconnect_backoff;
        let delay = {
            let mut state = self.state();
            if !state
                .table
                .was_stable(target, self.inner.config.min_stable_duration)
            {
                return false;
            }
            let attempts = state.table.reconnect_attempts(target);
            let Some(delay) = backoff.next_delay(attempts) else {
                info!(
                    "Giving up on direct link to {} after {} reconnects",
                    target.short(),
                    attempts
                );
                return false;
            };
            state.table.bump_reconnect(target);
            delay
        };

        debug!("Reconnecting to {} in {:?}", target.short(), delay);
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.attempt_upgrade(target).await;
        });
        true
    }

    // ------------------------------------------------------------------------
    // Signaling from the relayed channel
    // ------------------------------------------------------------------------

    /// Answer a `request-connection` from `from`
    pub fn handle_request(&self, from: PeerId) {
        if self.room().is_none() || from == self.inner.local {
            return;
        }
        let now = self.now();

        let accepted = {
            let mut state = self.state();
            let responder_since = match state.table.state(from).cloned() {
                Some(DirectLinkState::Pending {
                    role: LinkRole::Dialer,
                    started_at,
                }) => match state.table.resolve_crossing(from) {
                    Some(CrossingDecision::BecomeResponder) => Some(started_at),
                    _ => None,
                },
                Some(DirectLinkState::Pending {
                    role: LinkRole::Responder,
                    ..
                }) => {
                    // Repeated request for an attempt we already accepted
                    drop(state);
                    self.respond(from, true);
                    return;
                }
                Some(current) if current.is_established() => None,
                _ if state.table.established_count() >= self.inner.config.max_direct_links => None,
                _ => {
                    state.table.reserve(from, LinkRole::Responder, now);
                    state.outcomes.insert(from, watch::channel(None).0);
                    Some(now)
                }
            };
            if let Some(started_at) = responder_since {
                self.spawn_responder_watchdog(from, started_at);
            }
            responder_since.is_some()
        };

        debug!(
            "Connection request from {}: {}",
            from.short(),
            if accepted { "accepted" } else { "declined" }
        );
        self.respond(from, accepted);
    }

    fn respond(&self, to: PeerId, accepted: bool) {
        self.inner.relay.send(SignalingMessage::ConnectionResponse {
            target_peer_id: to,
            from_peer_id: self.inner.local,
            accepted,
            address: accepted.then(|| self.inner.transport.address()),
        });
    }

    /// Fail a responder entry if the dialer never shows up
    fn spawn_responder_watchdog(&self, from: PeerId, started_at: Timestamp) {
        let manager = self.clone();
        let wait = self.inner.config.attempt_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let stale = matches!(
                manager.state().table.state(from),
                Some(DirectLinkState::Pending {
                    role: LinkRole::Responder,
                    started_at: since,
                }) if *since == started_at
            );
            if stale {
                manager.fail(from, RoomlinkError::connection_timeout(from, wait));
            }
        });
    }

    /// Deliver a `connection-response` to the waiting attempt
    pub fn handle_response(&self, from: PeerId, accepted: bool, address: Option<String>) {
        match self.state().answers.remove(&from) {
            Some(waiting) => {
                let _ = waiting.send(Ok(Answer { accepted, address }));
            }
            None => debug!("Stale connection response from {}", from.short()),
        }
    }

    /// The coordinator could not route our request to `target`
    pub fn handle_peer_unavailable(&self, target: PeerId) {
        match self.state().answers.remove(&target) {
            Some(waiting) => {
                let _ = waiting.send(Err(RoomlinkError::peer_unavailable(target)));
            }
            None => debug!("No attempt waiting on unavailable peer {}", target.short()),
        }
    }

    /// A link dialed to us by a remote peer
    pub fn accept_incoming(&self, link: DirectLink) -> bool {
        let expected = matches!(
            self.state().table.state(link.remote),
            Some(DirectLinkState::Pending {
                role: LinkRole::Responder,
                ..
            })
        );
        if !expected {
            debug!("Refusing unexpected link from {}", link.remote.short());
            let _ = link.outbound.send(PeerFrame::Close {
                reason: "unexpected".into(),
            });
            return false;
        }
        self.install(link.remote, link)
    }

    // ------------------------------------------------------------------------
    // Link lifecycle
    // ------------------------------------------------------------------------

    /// Reader for `peer_id` ended; only the current generation counts
    pub fn handle_link_closed(&self, peer_id: PeerId, generation: u64) {
        let current = self
            .state()
            .links
            .get(&peer_id)
            .is_some_and(|link| link.generation == generation);
        if current {
            self.close_link(peer_id, "remote closed");
        }
    }

    /// Tear down the link to `peer_id` and retry it if it had been stable
    pub fn close_link(&self, peer_id: PeerId, reason: &str) {
        let now = self.now();
        let open_for = {
            let mut state = self.state();
            let Some(link) = state.links.remove(&peer_id) else {
                return;
            };
            let _ = link.outbound.send(PeerFrame::Close {
                reason: reason.to_string(),
            });
            link.reader.abort();
            state
                .table
                .mark_closed(peer_id, reason, now)
                .ok()
                .flatten()
        };
        info!("Direct link to {} closed ({})", peer_id.short(), reason);
        let reconnecting = self.schedule_reconnect(peer_id);
        self.emit(MeshEvent::LinkClosed {
            peer_id,
            open_for,
            reconnecting,
        });
    }

    /// Peer left the room: close and forget everything about it
    pub fn drop_peer(&self, peer_id: PeerId) {
        let mut state = self.state();
        if let Some(link) = state.links.remove(&peer_id) {
            let _ = link.outbound.send(PeerFrame::Close {
                reason: "peer left".into(),
            });
            link.reader.abort();
        }
        state.table.forget(peer_id);
        state.answers.remove(&peer_id);
        state.breakers.remove(&peer_id);
        Self::settle(&mut state, peer_id, false);
    }

    pub fn close_all(&self, reason: &str) {
        let mut state = self.state();
        for (_, link) in state.links.drain() {
            let _ = link.outbound.send(PeerFrame::Close {
                reason: reason.to_string(),
            });
            link.reader.abort();
        }
        let peers: Vec<PeerId> = state.outcomes.keys().copied().collect();
        for peer in peers {
            Self::settle(&mut state, peer, false);
        }
        state.answers.clear();
        state.breakers.clear();
        state.table = LinkTable::new(self.inner.local);
    }

    // ------------------------------------------------------------------------
    // Traffic and quality
    // ------------------------------------------------------------------------

    /// Queue a frame on an established link
    pub fn send_frame(&self, peer_id: PeerId, frame: PeerFrame) -> bool {
        let state = self.state();
        let established = state
            .table
            .state(peer_id)
            .is_some_and(DirectLinkState::is_established);
        match state.links.get(&peer_id) {
            Some(link) if established => link.outbound.send(frame).is_ok(),
            _ => false,
        }
    }

    pub fn direct_path(&self, peer_id: PeerId) -> Option<DirectPath> {
        let state = self.state();
        let link_state = state.table.state(peer_id)?;
        let condition = state
            .links
            .get(&peer_id)
            .map(|link| link.quality.condition())
            .unwrap_or_default();
        Some(DirectPath::from_state(link_state, condition))
    }

    pub fn is_usable(&self, peer_id: PeerId) -> bool {
        self.state()
            .table
            .state(peer_id)
            .is_some_and(DirectLinkState::is_usable)
    }

    /// Usable links with their measured scores
    pub fn usable_links(&self) -> Vec<(PeerId, u8)> {
        let state = self.state();
        state
            .table
            .open_peers()
            .into_iter()
            .filter_map(|peer| state.links.get(&peer).map(|link| (peer, link.quality.score())))
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.state().table.established_count()
    }

    /// Peers with a pending, open or degraded link
    pub fn live_peers(&self) -> Vec<PeerId> {
        self.state().table.live_peers()
    }

    /// Our links as advertised in presence records
    pub fn link_reports(&self) -> Vec<LinkReport> {
        let state = self.state();
        let mut reports: Vec<LinkReport> = state
            .links
            .iter()
            .filter(|(peer, _)| {
                state
                    .table
                    .state(**peer)
                    .is_some_and(DirectLinkState::is_usable)
            })
            .map(|(peer, link)| LinkReport {
                peer_id: *peer,
                quality: link.quality.score(),
            })
            .collect();
        reports.sort_by_key(|report| report.peer_id);
        reports
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let state = self.state();
        state
            .table
            .snapshot()
            .into_iter()
            .map(|(peer_id, link_state)| LinkSnapshot {
                peer_id,
                condition: state.links.get(&peer_id).map(|link| link.quality.condition()),
                state: link_state,
            })
            .collect()
    }

    /// Expire overdue probes, send a fresh probe on every link and apply the
    /// resulting open/degraded verdicts
    pub fn probe_tick(&self) -> Vec<QualityChange> {
        let now = self.now();
        let instant = Instant::now();
        let probe_timeout = self.inner.quality.probe_timeout;
        let padding = self.inner.quality.probe_payload_bytes;

        let mut state = self.state();
        let MeshState {
            table,
            links,
            next_nonce,
            ..
        } = &mut *state;

        let mut changes = Vec::new();
        let mut degraded_now = Vec::new();
        for (peer_id, link) in links.iter_mut() {
            let mut tier_changed = false;
            let overdue: Vec<u64> = link
                .probes
                .iter()
                .filter(|(_, sent)| instant.duration_since(**sent) > probe_timeout)
                .map(|(nonce, _)| *nonce)
                .collect();
            for nonce in overdue {
                link.probes.remove(&nonce);
                tier_changed |= link.quality.record_miss(now).is_some();
            }

            let nonce = *next_nonce;
            *next_nonce += 1;
            link.probes.insert(nonce, instant);
            let _ = link.outbound.send(PeerFrame::Probe {
                nonce,
                sent_at: now,
                padding: vec![0; padding],
            });

            let degraded = matches!(table.state(*peer_id), Some(DirectLinkState::Degraded { .. }));
            let state_changed = match link.quality.verdict(degraded, now) {
                QualityVerdict::Degrade => table.set_degraded(*peer_id, now).is_ok(),
                QualityVerdict::Recover => table.set_recovered(*peer_id, now).is_ok(),
                QualityVerdict::Steady => false,
            };
            if state_changed && !degraded {
                degraded_now.push((*peer_id, link.quality.score()));
            }
            if state_changed {
                info!(
                    "Direct link to {} {} (score {})",
                    peer_id.short(),
                    if degraded { "recovered" } else { "degraded" },
                    link.quality.score()
                );
            }
            if tier_changed || state_changed {
                changes.push(QualityChange {
                    peer_id: *peer_id,
                    condition: link.quality.condition(),
                    degraded: matches!(
                        table.state(*peer_id),
                        Some(DirectLinkState::Degraded { .. })
                    ),
                });
            }
        }
        drop(state);

        for (peer_id, score) in degraded_now {
            self.emit(MeshEvent::LinkDegraded {
                peer_id,
                error: RoomlinkError::network_degraded(peer_id, score),
            });
        }
        changes
    }

    /// Answer a probe from `peer_id`
    pub fn handle_probe(&self, peer_id: PeerId, nonce: u64, sent_at: Timestamp, padding: usize) {
        self.send_frame(
            peer_id,
            PeerFrame::ProbeReply {
                nonce,
                sent_at,
                padding_len: padding as u32,
            },
        );
    }

    /// Fold a probe reply into the link's quality
    pub fn handle_probe_reply(
        &self,
        peer_id: PeerId,
        nonce: u64,
        padding_len: u32,
    ) -> Option<QualityChange> {
        let now = self.now();
        let mut state = self.state();
        let MeshState { table, links, .. } = &mut *state;
        let link = links.get_mut(&peer_id)?;
        let Some(sent) = link.probes.remove(&nonce) else {
            warn!("Unsolicited probe reply from {}", peer_id.short());
            return None;
        };
        let rtt = Instant::now().duration_since(sent);
        let tier_changed = link
            .quality
            .record_reply(rtt, padding_len as usize, now)
            .is_some();

        let degraded = matches!(table.state(peer_id), Some(DirectLinkState::Degraded { .. }));
        let recovered = degraded
            && link.quality.verdict(true, now) == QualityVerdict::Recover
            && table.set_recovered(peer_id, now).is_ok();

        (tier_changed || recovered).then(|| QualityChange {
            peer_id,
            condition: link.quality.condition(),
            degraded: degraded && !recovered,
        })
    }
}
