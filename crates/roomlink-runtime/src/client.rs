//! Roomlink client
//!
//! One task per client owns the routing, discovery and session state and
//! reacts to everything in a single `select!` loop: user commands, the
//! relayed channel, direct-link traffic, mesh lifecycle events, bridge
//! outcomes and the periodic timers (relay ping, link probes, presence,
//! discovery, queue flush). The UI talks to it through [`ClientHandle`] and
//! listens on the [`AppEvent`] channel.

use roomlink_core::{
    config::RoomlinkConfig,
    presence::{CAPABILITY_BRIDGE, CAPABILITY_DIRECT},
    protocol::error_codes,
    ChatMessage, CircuitBreaker, Disposition, HealthInputs, HealthSignal, InboundPath, PeerDiscovery,
    PeerFrame, PeerId, PeerInfo, PresenceRecord, Priority, RelayHealth, RelayMonitor, Resume,
    RoomId, RoomlinkError, RoomlinkResult, RouteReport, SessionContinuity, SignalingMessage,
    SystemTimeSource, TimeSource, Timestamp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeHandled, BridgeOutcome, MessageBridge};
use crate::direct::{DirectLink, DirectTransport, IncomingLinks};
use crate::events::{AppEvent, AppEventReceiver, AppEventSender, ClientCommand, HealthSnapshot};
use crate::history::{HistorySink, MemoryHistory};
use crate::mesh::{LinkActivity, MeshEvent, MeshSettings, MeshUpgradeManager};
use crate::relay::{RelayConnection, RelayConnector, RelayHandle};
use crate::router::{HybridRouter, Received, Recipient};

/// Bound on a single relayed connection attempt
const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Client Builder
// ----------------------------------------------------------------------------

/// Assembles a client and spawns its task
pub struct ClientBuilder {
    peer_id: PeerId,
    config: RoomlinkConfig,
    clock: Arc<dyn TimeSource>,
    relay: Option<Arc<dyn RelayConnector>>,
    transport: Option<(Arc<dyn DirectTransport>, IncomingLinks)>,
    history: Arc<dyn HistorySink>,
}

impl ClientBuilder {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            config: RoomlinkConfig::default(),
            clock: Arc::new(SystemTimeSource::new()),
            relay: None,
            transport: None,
            history: Arc::new(MemoryHistory::default()),
        }
    }

    pub fn with_config(mut self, config: RoomlinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Connector for the relayed channel
    pub fn with_relay(mut self, relay: Arc<dyn RelayConnector>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Transport for direct links and the stream of links dialed to us
    pub fn with_transport(mut self, transport: Arc<dyn DirectTransport>, incoming: IncomingLinks) -> Self {
        self.transport = Some((transport, incoming));
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    /// Spawn the client task; must be called inside a tokio runtime
    pub fn spawn(self) -> RoomlinkResult<(ClientHandle, AppEventReceiver)> {
        self.config.validate()?;
        let connector = self
            .relay
            .ok_or_else(|| RoomlinkError::config_error("No relay connector configured"))?;
        let (transport, incoming_links) = self
            .transport
            .ok_or_else(|| RoomlinkError::config_error("No direct transport configured"))?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (app_events, app_event_rx) = mpsc::unbounded_channel();
        let (mesh_tx, mesh_events) = mpsc::unbounded_channel();
        let (activity_tx, link_activity) = mpsc::unbounded_channel();
        let (outcome_tx, bridge_outcomes) = mpsc::unbounded_channel();
        let (relay_results_tx, relay_results) = mpsc::unbounded_channel();
        let (reconnect_due_tx, reconnect_due) = mpsc::unbounded_channel();

        let config = self.config;
        let relay = RelayHandle::new();
        let mesh = MeshUpgradeManager::new(
            self.peer_id,
            MeshSettings {
                mesh: config.mesh.clone(),
                quality: config.quality.clone(),
                breaker: config.resilience.breaker.clone(),
            },
            self.clock.clone(),
            transport,
            relay.clone(),
            mesh_tx,
            activity_tx,
        );
        let router = HybridRouter::new(
            self.peer_id,
            &config,
            mesh.clone(),
            relay.clone(),
            self.clock.clone(),
        );
        let bridge = MessageBridge::new(
            self.peer_id,
            config.bridge.clone(),
            mesh.clone(),
            relay.clone(),
            outcome_tx,
        );

        let task = ClientTask {
            peer_id: self.peer_id,
            clock: self.clock.clone(),
            commands,
            app_events,
            connector,
            relay,
            relay_inbound: None,
            relay_results: (relay_results_tx, relay_results),
            reconnect_due: (reconnect_due_tx, reconnect_due),
            reconnect: ReconnectState::default(),
            relay_breaker: CircuitBreaker::new(config.resilience.breaker.clone()),
            monitor: RelayMonitor::new(config.router.relay_degraded_rtt),
            ping_outstanding: None,
            mesh,
            mesh_events,
            link_activity,
            incoming_links,
            router,
            bridge,
            bridge_outcomes,
            discovery: PeerDiscovery::new(self.peer_id, config.discovery.clone(), self.clock.clone()),
            discovery_running: Arc::new(AtomicBool::new(false)),
            history: self.history,
            session: SessionContinuity::new(config.resilience.session.clone()),
            room: None,
            pending_join: None,
            awaiting_confirmation: false,
            searching: false,
            signal: HealthSignal::Offline,
            running: true,
            config,
        };

        let peer_id = self.peer_id;
        let join_handle = tokio::spawn(task.run());
        Ok((
            ClientHandle {
                peer_id,
                commands: command_tx,
                task: Arc::new(std::sync::Mutex::new(Some(join_handle))),
            },
            app_event_rx,
        ))
    }
}

// ----------------------------------------------------------------------------
// Client Handle
// ----------------------------------------------------------------------------

/// Cloneable handle used by the UI layer
#[derive(Debug, Clone)]
pub struct ClientHandle {
    peer_id: PeerId,
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ClientHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn submit(&self, command: ClientCommand) -> RoomlinkResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RoomlinkError::channel_error("client task stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ClientCommand) -> RoomlinkResult<T> {
        let (reply, response) = oneshot::channel();
        self.submit(make(reply))?;
        response
            .await
            .map_err(|_| RoomlinkError::channel_error("client task dropped the request"))
    }

    /// Join `room_id`, leaving any current room; returns the other participants
    pub async fn join<N: Into<String>>(&self, room_id: RoomId, display_name: N) -> RoomlinkResult<Vec<PeerInfo>> {
        let display_name = display_name.into();
        self.request(|reply| ClientCommand::Join {
            room_id,
            display_name,
            reply,
        })
        .await?
    }

    pub fn leave(&self) -> RoomlinkResult<()> {
        self.submit(ClientCommand::Leave)
    }

    pub async fn send<C: Into<String>>(&self, content: C) -> RoomlinkResult<RouteReport> {
        self.send_with_priority(content, Priority::Normal).await
    }

    pub async fn send_with_priority<C: Into<String>>(
        &self,
        content: C,
        priority: Priority,
    ) -> RoomlinkResult<RouteReport> {
        let content = content.into();
        self.request(|reply| ClientCommand::Send {
            content,
            priority,
            reply,
        })
        .await?
    }

    /// Resume a session that needed re-confirmation
    pub fn confirm_rejoin(&self, display_name: Option<String>) -> RoomlinkResult<()> {
        self.submit(ClientCommand::ConfirmRejoin { display_name })
    }

    /// Try a direct link to `peer_id` now; true once it is open
    pub async fn upgrade(&self, peer_id: PeerId) -> RoomlinkResult<bool> {
        self.request(|reply| ClientCommand::Upgrade { peer_id, reply })
            .await
    }

    pub async fn health_snapshot(&self) -> RoomlinkResult<HealthSnapshot> {
        self.request(|reply| ClientCommand::HealthSnapshot { reply })
            .await
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(&self) {
        let _ = self.submit(ClientCommand::Shutdown);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Client Task
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReconnectState {
    /// Consecutive failed attempts
    failures: u32,
    /// An attempt is sleeping or in flight
    scheduled: bool,
    /// Budget spent and reported to the UI
    exhausted: bool,
}

#[derive(Debug, Clone)]
struct JoinedRoom {
    room_id: RoomId,
    display_name: String,
}

#[derive(Debug)]
struct PendingJoin {
    room_id: RoomId,
    display_name: String,
    reply: Option<oneshot::Sender<RoomlinkResult<Vec<PeerInfo>>>>,
}

struct Timers {
    ping: Interval,
    probe: Interval,
    presence: Interval,
    discovery: Interval,
    flush: Interval,
}

impl Timers {
    fn new(config: &RoomlinkConfig) -> Self {
        let make = |period: Duration| {
            let mut timer = interval(period.max(Duration::from_millis(1)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        };
        Self {
            ping: make(config.router.relay_ping_interval),
            probe: make(config.quality.probe_interval),
            presence: make(config.discovery.presence_interval),
            discovery: make(config.discovery.discovery_interval),
            flush: make(config.router.relay_ping_interval),
        }
    }
}

async fn recv_optional<T>(receiver: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => futures::future::pending().await,
    }
}

struct ClientTask {
    peer_id: PeerId,
    config: RoomlinkConfig,
    clock: Arc<dyn TimeSource>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    app_events: AppEventSender,

    connector: Arc<dyn RelayConnector>,
    relay: RelayHandle,
    relay_inbound: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    relay_results: (
        mpsc::UnboundedSender<RoomlinkResult<RelayConnection>>,
        mpsc::UnboundedReceiver<RoomlinkResult<RelayConnection>>,
    ),
    reconnect_due: (mpsc::UnboundedSender<()>, mpsc::UnboundedReceiver<()>),
    reconnect: ReconnectState,
    relay_breaker: CircuitBreaker,
    monitor: RelayMonitor,
    ping_outstanding: Option<(Timestamp, Instant)>,

    mesh: MeshUpgradeManager,
    mesh_events: mpsc::UnboundedReceiver<MeshEvent>,
    link_activity: mpsc::UnboundedReceiver<LinkActivity>,
    incoming_links: IncomingLinks,

    router: HybridRouter,
    bridge: MessageBridge,
    bridge_outcomes: mpsc::UnboundedReceiver<BridgeOutcome>,

    discovery: PeerDiscovery,
    discovery_running: Arc<AtomicBool>,
    history: Arc<dyn HistorySink>,
    session: SessionContinuity,

    room: Option<JoinedRoom>,
    pending_join: Option<PendingJoin>,
    awaiting_confirmation: bool,
    searching: bool,
    signal: HealthSignal,
    running: bool,
}

impl ClientTask {
    async fn run(mut self) {
        info!("Client {} starting", self.peer_id.short());
        let mut timers = Timers::new(&self.config);
        self.schedule_relay_attempt(Duration::ZERO);

        while self.running {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped");
                        self.shutdown();
                    }
                },
                message = recv_optional(&mut self.relay_inbound) => match message {
                    Some(message) => self.handle_signaling(message),
                    None => self.relay_lost(),
                },
                Some(result) = self.relay_results.1.recv() => self.relay_attempt_finished(result),
                Some(()) = self.reconnect_due.1.recv() => self.start_relay_attempt(),
                Some(event) = self.mesh_events.recv() => self.handle_mesh_event(event),
                Some(activity) = self.link_activity.recv() => self.handle_link_activity(activity),
                Some(link) = self.incoming_links.recv() => self.accept_link(link),
                Some(outcome) = self.bridge_outcomes.recv() => self.handle_bridge_outcome(outcome),
                _ = timers.ping.tick() => self.ping_relay(),
                _ = timers.probe.tick() => self.probe_links(),
                _ = timers.presence.tick() => self.broadcast_presence(),
                _ = timers.discovery.tick() => self.start_discovery_round(),
                _ = timers.flush.tick() => self.flush_queue(),
            }
        }
        info!("Client {} stopped", self.peer_id.short());
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn emit(&self, event: AppEvent) {
        if self.app_events.send(event).is_err() {
            debug!("App event receiver dropped");
        }
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.mesh.close_all("shutdown");
        if self.room.is_some() {
            self.relay.send(SignalingMessage::LeaveRoom);
        }
        self.relay.clear();
        self.relay_inbound = None;
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    fn refresh_health(&mut self) {
        let relay = self.monitor.health();
        self.router.set_relay_health(relay);
        let signal = HealthSignal::derive(HealthInputs {
            relay,
            reconnecting: relay == RelayHealth::Down && self.reconnect.scheduled,
            coordinator_exhausted: self.reconnect.exhausted,
            searching: self.searching,
            direct_links: self.mesh.established_count(),
        });
        if signal != self.signal {
            info!("Client {} health {:?} -> {:?}", self.peer_id.short(), self.signal, signal);
            self.signal = signal;
            self.emit(AppEvent::HealthChanged { signal });
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            peer_id: self.peer_id,
            room_id: self.room.as_ref().map(|room| room.room_id.clone()),
            signal: self.signal,
            relay: self.monitor.health(),
            relay_rtt: self.monitor.last_rtt(),
            links: self.mesh.snapshot(),
            stats: self.router.stats().clone(),
            queued: self.router.queued(),
        }
    }

    // ------------------------------------------------------------------------
    // Relayed channel lifecycle
    // ------------------------------------------------------------------------

    fn schedule_relay_attempt(&mut self, delay: Duration) {
        if self.reconnect.scheduled || !self.running {
            return;
        }
        self.reconnect.scheduled = true;
        let due = self.reconnect_due.0.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due.send(());
        });
    }

    fn start_relay_attempt(&mut self) {
        self.reconnect.scheduled = false;
        if !self.running || self.relay.is_connected() {
            return;
        }
        let now = self.now();
        if !self.relay_breaker.allow_attempt(now) {
            let wait = self
                .relay_breaker
                .retry_in(now)
                .min(self.config.resilience.relay_backoff.cap)
                .max(Duration::from_millis(10));
            debug!("Relay breaker open, retrying in {:?}", wait);
            self.schedule_relay_attempt(wait);
            return;
        }

        self.reconnect.scheduled = true;
        let connector = self.connector.clone();
        let results = self.relay_results.0.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(RELAY_CONNECT_TIMEOUT, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(RoomlinkError::coordinator_unreachable(format!(
                    "connecting to {} timed out",
                    connector.describe()
                ))),
            };
            let _ = results.send(result);
        });
    }

    fn relay_attempt_finished(&mut self, result: RoomlinkResult<RelayConnection>) {
        self.reconnect.scheduled = false;
        match result {
            Ok(connection) if self.running => self.relay_connected(connection),
            Ok(_) => {}
            Err(e) => {
                let now = self.now();
                self.relay_breaker.record_failure(now);
                self.reconnect.failures += 1;
                let backoff = &self.config.resilience.relay_backoff;
                warn!(
                    "Relayed connection attempt {} failed: {}",
                    self.reconnect.failures, e
                );
                let delay = match backoff.next_delay(self.reconnect.failures - 1) {
                    Some(delay) => delay,
                    None => {
                        if !self.reconnect.exhausted {
                            self.reconnect.exhausted = true;
                            error!(
                                "Coordinator unreachable after {} attempts",
                                self.reconnect.failures
                            );
                            self.emit(AppEvent::CoordinatorUnreachable {
                                attempts: self.reconnect.failures,
                            });
                        }
                        backoff.cap
                    }
                };
                self.schedule_relay_attempt(delay);
                self.refresh_health();
            }
        }
    }

    fn relay_connected(&mut self, connection: RelayConnection) {
        info!("Client {} relayed channel up", self.peer_id.short());
        self.relay.set(connection.outbound);
        self.relay_inbound = Some(connection.inbound);
        self.relay_breaker.record_success();
        self.reconnect = ReconnectState::default();
        self.ping_outstanding = None;
        self.monitor.set_connected(true);
        self.discovery.set_roster_available(true);

        let now = self.now();
        match self.session.resume(now) {
            Resume::Rejoin {
                room_id,
                display_name,
            } => {
                info!("Rejoining {} as {}", room_id, display_name);
                self.request_join(room_id, display_name, None);
            }
            Resume::Reconfirm {
                room_id,
                display_name,
                gap,
            } => {
                info!("Session gap {:?} needs re-confirmation", gap);
                self.awaiting_confirmation = true;
                self.emit(AppEvent::RejoinConfirmationRequired {
                    room_id,
                    display_name,
                    gap,
                });
            }
            Resume::Nothing => {}
        }
        self.refresh_health();
    }

    fn relay_lost(&mut self) {
        warn!("Client {} lost its relayed channel", self.peer_id.short());
        self.relay.clear();
        self.relay_inbound = None;
        self.ping_outstanding = None;
        self.monitor.set_connected(false);
        self.discovery.set_roster_available(false);
        if let Some(pending) = self.pending_join.take() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(RoomlinkError::coordinator_unreachable(
                    "relayed channel closed during join",
                )));
            }
        }
        self.schedule_relay_attempt(Duration::ZERO);
        self.refresh_health();
    }

    fn ping_relay(&mut self) {
        if !self.relay.is_connected() {
            return;
        }
        if let Some((_, sent)) = self.ping_outstanding {
            if sent.elapsed() < self.config.router.relay_pong_timeout {
                return;
            }
            debug!("Relay health ping unanswered");
            self.monitor.record_missed();
            self.ping_outstanding = None;
            self.refresh_health();
        }
        let timestamp = self.now();
        if self.relay.send(SignalingMessage::HealthPing { timestamp }) {
            self.ping_outstanding = Some((timestamp, Instant::now()));
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Join {
                room_id,
                display_name,
                reply,
            } => self.join(room_id, display_name, reply),
            ClientCommand::Leave => self.leave(),
            ClientCommand::ConfirmRejoin { display_name } => self.confirm_rejoin(display_name),
            ClientCommand::Send {
                content,
                priority,
                reply,
            } => {
                let _ = reply.send(self.send(content, priority));
            }
            ClientCommand::Upgrade { peer_id, reply } => {
                let mesh = self.mesh.clone();
                tokio::spawn(async move {
                    let _ = reply.send(mesh.attempt_upgrade(peer_id).await);
                });
            }
            ClientCommand::HealthSnapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ClientCommand::Shutdown => self.shutdown(),
        }
    }

    fn join(
        &mut self,
        room_id: RoomId,
        display_name: String,
        reply: oneshot::Sender<RoomlinkResult<Vec<PeerInfo>>>,
    ) {
        let display_name = display_name.trim().to_string();
        if display_name.is_empty() {
            let _ = reply.send(Err(RoomlinkError::invalid_message("Display name is empty")));
            return;
        }
        if self
            .room
            .as_ref()
            .is_some_and(|current| current.room_id != room_id)
        {
            self.clear_room();
        }
        if !self.relay.is_connected() {
            // Remembered so the next reconnect joins on our behalf
            self.session.remember(room_id, display_name, self.now());
            let _ = reply.send(Err(RoomlinkError::coordinator_unreachable(
                "relayed channel down",
            )));
            return;
        }
        self.request_join(room_id, display_name, Some(reply));
    }

    fn request_join(
        &mut self,
        room_id: RoomId,
        display_name: String,
        reply: Option<oneshot::Sender<RoomlinkResult<Vec<PeerInfo>>>>,
    ) {
        if let Some(previous) = self.pending_join.take() {
            if let Some(previous_reply) = previous.reply {
                let _ = previous_reply.send(Err(RoomlinkError::invalid_message(
                    "superseded by a newer join",
                )));
            }
        }
        self.relay.send(SignalingMessage::JoinRoom {
            room_id: room_id.clone(),
            peer_id: self.peer_id,
            display_name: display_name.clone(),
        });
        self.pending_join = Some(PendingJoin {
            room_id,
            display_name,
            reply,
        });
    }

    fn confirm_rejoin(&mut self, display_name: Option<String>) {
        if !self.awaiting_confirmation {
            debug!("No rejoin awaiting confirmation");
            return;
        }
        let (Some(room_id), Some(remembered)) = (
            self.session.room_id().cloned(),
            self.session.display_name().map(str::to_string),
        ) else {
            return;
        };
        self.awaiting_confirmation = false;
        let display_name = display_name.unwrap_or(remembered);
        self.request_join(room_id, display_name, None);
    }

    /// Drop all per-room state
    fn clear_room(&mut self) {
        if let Some(room) = self.room.take() {
            self.mesh.set_room(None);
            self.router.forget_room(&room.room_id);
            self.discovery.forget_room(&room.room_id);
        }
    }

    fn leave(&mut self) {
        if self.room.is_none() && self.pending_join.is_none() {
            return;
        }
        self.relay.send(SignalingMessage::LeaveRoom);
        self.pending_join = None;
        self.awaiting_confirmation = false;
        self.session.forget();
        self.clear_room();
        self.refresh_health();
    }

    fn recipients(&self, room_id: &RoomId) -> Vec<Recipient> {
        let mut peers = self.discovery.roster_peers(room_id);
        for row in self.mesh.snapshot() {
            if row.state.is_established() && !peers.contains(&row.peer_id) {
                peers.push(row.peer_id);
            }
        }
        peers
            .into_iter()
            .map(|peer_id| Recipient {
                peer_id,
                relay_quality: self
                    .discovery
                    .registry()
                    .get(peer_id)
                    .map(|record| record.quality),
            })
            .collect()
    }

    fn send(&mut self, content: String, priority: Priority) -> RoomlinkResult<RouteReport> {
        let room = self
            .room
            .clone()
            .ok_or_else(|| RoomlinkError::invalid_message("Not in a room"))?;
        let message = ChatMessage::new(
            room.room_id.clone(),
            self.peer_id,
            room.display_name,
            content,
            self.now(),
        )
        .with_priority(priority);
        message.validate(self.config.coordinator.max_message_len)?;

        let recipients = self.recipients(&room.room_id);
        let dispatch = self.router.send(message.clone(), &recipients);

        for recipient in &dispatch.bridged {
            let candidates = self.bridge.candidates(*recipient, self.discovery.registry());
            self.bridge.dispatch(message.clone(), *recipient, candidates);
        }
        if let Some(delivered_at) = dispatch.delivered_at {
            let mut message = message;
            message.delivered_at = Some(delivered_at);
            self.delivered(message);
        }
        for message_id in dispatch.evicted {
            self.emit(AppEvent::MessageFailed {
                message_id,
                reason: "outbound queue full".into(),
            });
        }
        Ok(dispatch.report)
    }

    // ------------------------------------------------------------------------
    // Signaling from the coordinator
    // ------------------------------------------------------------------------

    fn handle_signaling(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Roster { room_id, peers } => self.joined(room_id, peers),
            SignalingMessage::PeerJoined {
                peer_id,
                display_name,
            } => {
                let Some(room_id) = self.room.as_ref().map(|room| room.room_id.clone()) else {
                    return;
                };
                self.discovery.add_roster_peer(
                    &room_id,
                    PeerInfo {
                        peer_id,
                        display_name: display_name.clone(),
                    },
                );
                self.emit(AppEvent::PeerJoined {
                    peer_id,
                    display_name,
                });
                self.start_discovery_round();
            }
            SignalingMessage::PeerLeft {
                peer_id,
                display_name,
                reason,
            } => {
                if let Some(room) = &self.room {
                    self.discovery.remove_peer(&room.room_id, peer_id);
                }
                self.mesh.drop_peer(peer_id);
                self.emit(AppEvent::PeerLeft {
                    peer_id,
                    display_name,
                    reason,
                });
                self.refresh_health();
            }
            SignalingMessage::ChatMessage { message, .. } => {
                self.receive_chat(message, InboundPath::Relayed)
            }
            SignalingMessage::DeliveryAck {
                message_id,
                delivered_at,
            } => {
                if let Some(message) = self.router.confirm(message_id, delivered_at) {
                    self.delivered(message);
                }
            }
            SignalingMessage::RequestConnection { from_peer_id, .. } => {
                self.mesh.handle_request(from_peer_id)
            }
            SignalingMessage::ConnectionResponse {
                from_peer_id,
                accepted,
                address,
                ..
            } => self.mesh.handle_response(from_peer_id, accepted, address),
            SignalingMessage::HealthPing { timestamp } => {
                self.relay.send(SignalingMessage::HealthPong {
                    timestamp: self.now(),
                    original_timestamp: timestamp,
                });
            }
            SignalingMessage::HealthPong {
                original_timestamp, ..
            } => {
                if let Some((sent_at, sent)) = self.ping_outstanding {
                    if sent_at == original_timestamp {
                        self.ping_outstanding = None;
                        self.monitor.record_pong(sent.elapsed());
                        self.session.mark_connected(self.now());
                        self.refresh_health();
                    }
                }
            }
            SignalingMessage::Presence { record } => {
                self.discovery.observe_presence(record);
            }
            SignalingMessage::Relay {
                from_peer_id,
                envelope,
                ..
            } => self.handle_frame(from_peer_id, envelope, InboundPath::Relayed),
            SignalingMessage::Error { code, detail } => self.coordinator_error(code, detail),
            SignalingMessage::JoinRoom { .. } | SignalingMessage::LeaveRoom => {
                debug!("Ignoring client-only message from coordinator");
            }
        }
    }

    fn coordinator_error(&mut self, code: String, detail: String) {
        let join_rejected = code == error_codes::ROOM_FULL || code == error_codes::INVALID_MESSAGE;
        if join_rejected {
            if let Some(pending) = self.pending_join.take() {
                let error = if code == error_codes::ROOM_FULL {
                    RoomlinkError::RoomFull {
                        room_id: pending.room_id.to_string(),
                        limit: self.config.coordinator.max_room_participants,
                    }
                } else {
                    RoomlinkError::invalid_message(detail)
                };
                warn!("Join of {} rejected: {}", pending.room_id, error);
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Err(error));
                }
                return;
            }
        }
        if code == error_codes::PEER_NOT_FOUND {
            if let Ok(peer_id) = detail.parse::<PeerId>() {
                self.mesh.handle_peer_unavailable(peer_id);
            }
        }
        warn!("Coordinator error {}: {}", code, detail);
    }

    fn joined(&mut self, room_id: RoomId, peers: Vec<PeerInfo>) {
        let pending = match self.pending_join.take() {
            Some(pending) if pending.room_id == room_id => Some(pending),
            other => {
                self.pending_join = other;
                None
            }
        };
        let display_name = match &pending {
            Some(pending) => pending.display_name.clone(),
            None if self.session.room_id() == Some(&room_id) => self
                .session
                .display_name()
                .unwrap_or_default()
                .to_string(),
            None => {
                warn!("Unsolicited roster for {}", room_id);
                return;
            }
        };
        let now = self.now();
        info!(
            "Client {} joined {} with {} peers",
            self.peer_id.short(),
            room_id,
            peers.len()
        );

        self.session.remember(room_id.clone(), display_name.clone(), now);
        self.session.mark_connected(now);
        self.room = Some(JoinedRoom {
            room_id: room_id.clone(),
            display_name,
        });
        self.mesh.set_room(Some(room_id.clone()));
        self.discovery.update_roster(&room_id, &peers);

        let replayed = self.history.replay(&room_id);
        if !replayed.is_empty() {
            self.emit(AppEvent::HistoryReplayed {
                room_id: room_id.clone(),
                messages: replayed,
            });
        }
        self.emit(AppEvent::Joined {
            room_id,
            peers: peers.clone(),
        });
        if let Some(reply) = pending.and_then(|pending| pending.reply) {
            let _ = reply.send(Ok(peers));
        }

        self.broadcast_presence();
        self.start_discovery_round();
        self.flush_queue();
        self.refresh_health();
    }

    fn receive_chat(&mut self, message: ChatMessage, path: InboundPath) {
        match self.router.on_receive(message.clone(), path) {
            Received::New(message) => {
                self.history.record(&message);
                self.emit(AppEvent::MessageReceived { message, path });
            }
            Received::Echo {
                confirmed: Some(message),
                ..
            } => self.delivered(message),
            Received::Echo { .. } | Received::Duplicate => {}
        }
    }

    /// One of our messages was confirmed; only now does it enter history
    fn delivered(&mut self, message: ChatMessage) {
        self.history.record(&message);
        self.emit(AppEvent::MessageDelivered {
            message_id: message.id,
            delivered_at: message.delivered_at.unwrap_or_else(|| self.now()),
        });
    }

    // ------------------------------------------------------------------------
    // Direct links
    // ------------------------------------------------------------------------

    fn accept_link(&mut self, link: DirectLink) {
        self.mesh.accept_incoming(link);
    }

    fn handle_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::LinkOpened { peer_id, role } => {
                debug!("Link to {} open as {:?}", peer_id.short(), role);
                self.searching = false;
                self.broadcast_presence();
                self.flush_queue();
            }
            MeshEvent::LinkClosed {
                peer_id,
                open_for,
                reconnecting,
            } => {
                debug!(
                    "Link to {} closed after {:?}, reconnecting {}",
                    peer_id.short(),
                    open_for,
                    reconnecting
                );
            }
            MeshEvent::AttemptFailed { peer_id, error } => {
                debug!("Upgrade to {} failed", peer_id.short());
                self.link_error(error);
            }
            MeshEvent::LinkDegraded { peer_id, error } => {
                debug!("Link to {} degraded", peer_id.short());
                self.link_error(error);
            }
        }
        self.refresh_health();
    }

    fn link_error(&mut self, error: RoomlinkError) {
        match error.disposition() {
            Disposition::StatusChange => {
                info!("Searching for connection: {}", error);
                self.searching = true;
            }
            Disposition::Silent | Disposition::StatsOnly => debug!("{}", error),
            Disposition::Banner | Disposition::Fatal => error!("{}", error),
        }
    }

    fn handle_link_activity(&mut self, activity: LinkActivity) {
        match activity {
            LinkActivity::Frame { peer_id, frame } => {
                self.handle_frame(peer_id, frame, InboundPath::Direct)
            }
            LinkActivity::Closed {
                peer_id,
                generation,
            } => {
                self.mesh.handle_link_closed(peer_id, generation);
                self.refresh_health();
            }
        }
    }

    fn handle_frame(&mut self, from: PeerId, frame: PeerFrame, path: InboundPath) {
        match frame {
            PeerFrame::Hello { .. } => {}
            PeerFrame::Chat(message) => self.receive_chat(message, path),
            PeerFrame::Probe {
                nonce,
                sent_at,
                padding,
            } => self.mesh.handle_probe(from, nonce, sent_at, padding.len()),
            PeerFrame::ProbeReply {
                nonce, padding_len, ..
            } => {
                if let Some(change) = self.mesh.handle_probe_reply(from, nonce, padding_len) {
                    self.emit(AppEvent::ConnectionQualityChanged {
                        peer_id: change.peer_id,
                        tier: change.condition.tier,
                        score: change.condition.score,
                        degraded: change.degraded,
                    });
                }
            }
            PeerFrame::Presence(record) => {
                self.discovery.observe_presence(record);
            }
            frame @ (PeerFrame::Bridge(_) | PeerFrame::BridgeAck { .. } | PeerFrame::BridgeNack { .. }) => {
                match self.bridge.handle_frame(from, frame) {
                    BridgeHandled::Deliver(message) => {
                        self.receive_chat(message, InboundPath::Bridge)
                    }
                    BridgeHandled::Forwarded => self.router.record_bridged_for_others(),
                    BridgeHandled::Rejected(_)
                    | BridgeHandled::Acknowledged
                    | BridgeHandled::Ignored => {}
                }
            }
            PeerFrame::Close { reason } => {
                if path == InboundPath::Direct {
                    self.mesh.close_link(from, &reason);
                    self.refresh_health();
                }
            }
        }
    }

    fn handle_bridge_outcome(&mut self, outcome: BridgeOutcome) {
        match outcome {
            BridgeOutcome::Delivered {
                message_id,
                recipient,
                via,
                acknowledged,
            } => {
                debug!(
                    "Bridged {} to {} via {} (acknowledged {})",
                    message_id,
                    recipient.short(),
                    via.short(),
                    acknowledged
                );
                let now = self.now();
                if let Some(message) = self.router.confirm(message_id, now) {
                    self.delivered(message);
                }
            }
            BridgeOutcome::Exhausted {
                message,
                recipient,
                reason,
            } => {
                debug!("Bridge gave up on {}: {:?}", message.id, reason);
                let (_, evicted) = self.router.bridge_exhausted(message, recipient);
                for message_id in evicted {
                    self.emit(AppEvent::MessageFailed {
                        message_id,
                        reason: "outbound queue full".into(),
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------------

    fn probe_links(&mut self) {
        for change in self.mesh.probe_tick() {
            self.emit(AppEvent::ConnectionQualityChanged {
                peer_id: change.peer_id,
                tier: change.condition.tier,
                score: change.condition.score,
                degraded: change.degraded,
            });
        }
        self.refresh_health();
    }

    fn broadcast_presence(&mut self) {
        let Some(room) = &self.room else {
            return;
        };
        let mut record = PresenceRecord::new(
            self.peer_id,
            room.room_id.clone(),
            self.now(),
            self.monitor.quality_score(),
        )
        .with_capability(CAPABILITY_DIRECT)
        .with_links(self.mesh.link_reports());
        if self.config.bridge.enabled {
            record = record.with_capability(CAPABILITY_BRIDGE);
        }

        for (peer_id, _) in self.mesh.usable_links() {
            self.mesh
                .send_frame(peer_id, PeerFrame::Presence(record.clone()));
        }
        self.relay.send(SignalingMessage::Presence { record });
    }

    /// Attempt upgrades to the best new candidates one at a time, spaced out
    fn start_discovery_round(&mut self) {
        let Some(room_id) = self.room.as_ref().map(|room| room.room_id.clone()) else {
            return;
        };
        if self.discovery_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let candidates = self.discovery.discover(&room_id, &self.mesh.live_peers());
        if candidates.is_empty() {
            self.discovery_running.store(false, Ordering::SeqCst);
            return;
        }

        debug!(
            "Discovery round for {}: {} candidates",
            self.peer_id.short(),
            candidates.len()
        );
        let mesh = self.mesh.clone();
        let running = self.discovery_running.clone();
        let spacing = self.config.discovery.inter_attempt_delay;
        tokio::spawn(async move {
            for (index, candidate) in candidates.into_iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(spacing).await;
                }
                mesh.attempt_upgrade(candidate.peer_id).await;
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    fn flush_queue(&mut self) {
        let report = self.router.flush_queue();
        for message in report.delivered {
            self.delivered(message);
        }
        for (message_id, reason) in report.dropped {
            self.emit(AppEvent::MessageFailed {
                message_id,
                reason: reason.as_str().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RoomCoordinator;
    use crate::direct::MemoryNetwork;
    use crate::relay::LocalRelay;
    use roomlink_core::config::CoordinatorConfig;

    fn create_test_peer_id(id: u8) -> PeerId {
        PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
    }

    #[tokio::test]
    async fn test_builder_requires_relay_and_transport() {
        let network = MemoryNetwork::new();
        let (transport, incoming) = network.transport(create_test_peer_id(1));
        let result = ClientBuilder::new(create_test_peer_id(1))
            .with_transport(Arc::new(transport), incoming)
            .spawn();
        assert!(matches!(result, Err(RoomlinkError::Configuration { .. })));

        let coordinator = Arc::new(RoomCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(SystemTimeSource::new()),
        ));
        let result = ClientBuilder::new(create_test_peer_id(1))
            .with_relay(Arc::new(LocalRelay::new(coordinator)))
            .spawn();
        assert!(matches!(result, Err(RoomlinkError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_join_while_coordinator_down_is_remembered_for_reconnect() {
        let coordinator = Arc::new(RoomCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(SystemTimeSource::new()),
        ));
        let relay = LocalRelay::new(coordinator.clone());
        relay.set_available(false);
        let network = MemoryNetwork::new();
        let peer = create_test_peer_id(1);
        let (transport, incoming) = network.transport(peer);
        let (handle, mut events) = ClientBuilder::new(peer)
            .with_config(RoomlinkConfig::testing())
            .with_relay(Arc::new(relay.clone()))
            .with_transport(Arc::new(transport), incoming)
            .spawn()
            .unwrap();

        let room = RoomId::new("lobby").unwrap();
        let result = handle.join(room.clone(), "ann").await;
        assert!(matches!(result, Err(RoomlinkError::CoordinatorUnreachable { .. })));

        relay.set_available(true);
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let AppEvent::Joined { room_id, .. } = event {
                    return Some(room_id);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(joined, Some(room.clone()));
        assert_eq!(
            coordinator.participant(peer).map(|p| p.display_name),
            Some("ann".to_string())
        );

        let snapshot = handle.health_snapshot().await.unwrap();
        assert_eq!(snapshot.room_id, Some(room));
        handle.shutdown().await;
        assert!(handle.health_snapshot().await.is_err());
    }

    async fn next_matching<F>(events: &mut AppEventReceiver, mut wanted: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel open");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event in time")
    }

    #[tokio::test]
    async fn test_history_holds_only_confirmed_messages() {
        let coordinator = Arc::new(RoomCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(SystemTimeSource::new()),
        ));
        let relay = LocalRelay::new(coordinator);
        let network = MemoryNetwork::new();
        let peer = create_test_peer_id(1);
        let (transport, incoming) = network.transport(peer);
        let history = Arc::new(MemoryHistory::default());
        let (handle, mut events) = ClientBuilder::new(peer)
            .with_config(RoomlinkConfig::testing())
            .with_relay(Arc::new(relay.clone()))
            .with_transport(Arc::new(transport), incoming)
            .with_history(history.clone())
            .spawn()
            .unwrap();
        let room = RoomId::new("lobby").unwrap();
        handle.join(room.clone(), "ann").await.unwrap();

        relay.set_available(false);
        relay.sever();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.health_snapshot().await.unwrap().relay != RelayHealth::Down {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let report = handle.send("into the void").await.unwrap();
        assert!(report.queued);
        assert!(history.replay(&room).is_empty());

        let lost = report.message_id;
        next_matching(&mut events, |event| {
            matches!(event, AppEvent::MessageFailed { message_id, .. } if *message_id == lost)
        })
        .await;
        assert!(history.replay(&room).is_empty());

        relay.set_available(true);
        next_matching(&mut events, |event| matches!(event, AppEvent::Joined { .. })).await;
        let report = handle.send("made it").await.unwrap();
        let sent = report.message_id;
        next_matching(&mut events, |event| {
            matches!(event, AppEvent::MessageDelivered { message_id, .. } if *message_id == sent)
        })
        .await;

        let recorded = history.replay(&room);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].id, sent);
        assert!(recorded[0].delivered_at.is_some());
        handle.shutdown().await;
    }
}
