//! Relayed channel connectors
//!
//! A client's relayed connection is a pair of unbounded channels carrying
//! [`SignalingMessage`]s. [`WebSocketRelay`] backs them with a socket to a
//! remote coordinator; [`LocalRelay`] wires them straight into an in-process
//! [`RoomCoordinator`] and can simulate outages and latency.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use roomlink_core::{ConnectionId, RoomlinkError, RoomlinkResult, SignalingMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::coordinator::RoomCoordinator;

/// Live relayed connection: outbound to the coordinator, inbound from it.
/// The connection is gone once `inbound` yields `None`.
#[derive(Debug)]
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<SignalingMessage>,
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
}

/// Opens relayed connections to a coordinator
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> RoomlinkResult<RelayConnection>;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

/// Shared sender for whichever relayed connection is currently up
#[derive(Debug, Clone, Default)]
pub struct RelayHandle {
    current: Arc<Mutex<Option<mpsc::UnboundedSender<SignalingMessage>>>>,
}

impl RelayHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<SignalingMessage>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, sender: mpsc::UnboundedSender<SignalingMessage>) {
        *self.slot() = Some(sender);
    }

    pub fn clear(&self) {
        *self.slot() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.slot().as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Queue a message on the relayed connection; false if it is down
    pub fn send(&self, message: SignalingMessage) -> bool {
        match self.slot().as_ref() {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// In-process Relay
// ----------------------------------------------------------------------------

/// Connector to a coordinator running in the same process
#[derive(Debug, Clone)]
pub struct LocalRelay {
    coordinator: Arc<RoomCoordinator>,
    available: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    current: Arc<Mutex<Option<ConnectionId>>>,
}

impl LocalRelay {
    pub fn new(coordinator: Arc<RoomCoordinator>) -> Self {
        Self {
            coordinator,
            available: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn coordinator(&self) -> &Arc<RoomCoordinator> {
        &self.coordinator
    }

    /// Refuse or allow new connections
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied to every client-to-coordinator message
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop the current connection as if the network went away
    pub fn sever(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(connection_id) = current {
            info!("Severing relayed connection {}", connection_id);
            self.coordinator.disconnect(connection_id);
        }
    }
}

#[async_trait]
impl RelayConnector for LocalRelay {
    async fn connect(&self) -> RoomlinkResult<RelayConnection> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RoomlinkError::coordinator_unreachable(
                "in-process coordinator unavailable",
            ));
        }

        let (connection_id, inbound) = self.coordinator.register_connection();
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(connection_id);

        let (outbound, mut from_client) = mpsc::unbounded_channel::<SignalingMessage>();
        let coordinator = self.coordinator.clone();
        let latency_ms = self.latency_ms.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client.recv().await {
                let delay = latency_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                coordinator.handle_message(connection_id, message);
            }
            coordinator.disconnect(connection_id);
        });

        debug!("Local relay connection {} opened", connection_id);
        Ok(RelayConnection { outbound, inbound })
    }

    fn describe(&self) -> String {
        "in-process coordinator".to_string()
    }
}

// ----------------------------------------------------------------------------
// WebSocket Relay
// ----------------------------------------------------------------------------

/// Connector to a coordinator served by [`crate::server::CoordinatorServer`]
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
}

impl WebSocketRelay {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RelayConnector for WebSocketRelay {
    async fn connect(&self) -> RoomlinkResult<RelayConnection> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RoomlinkError::coordinator_unreachable(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbound, mut to_server) = mpsc::unbounded_channel::<SignalingMessage>();
        let (to_client, inbound) = mpsc::unbounded_channel::<SignalingMessage>();

        tokio::spawn(async move {
            while let Some(message) = to_server.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", message.kind(), e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::decode(&text) {
                        Ok(message) => {
                            if to_client.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Undecodable frame from coordinator: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("Coordinator socket closed");
        });

        info!("Connected to coordinator at {}", self.url);
        Ok(RelayConnection { outbound, inbound })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
