//! WebSocket front end for the Room Coordinator
//!
//! Each accepted socket becomes one relayed connection: inbound text frames
//! are decoded as [`SignalingMessage`]s and handed to the coordinator, and a
//! forwarder task drains the connection's outbound channel back onto the
//! socket. When the coordinator drops the channel (replacement, liveness
//! timeout) the forwarder closes the socket.

use futures::{SinkExt, StreamExt};
use roomlink_core::{protocol::error_codes, RoomlinkResult, SignalingMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::coordinator::RoomCoordinator;

/// Accept loop serving the coordinator over WebSocket
pub struct CoordinatorServer {
    listener: TcpListener,
    coordinator: Arc<RoomCoordinator>,
}

impl CoordinatorServer {
    pub async fn bind(addr: &str, coordinator: Arc<RoomCoordinator>) -> RoomlinkResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> RoomlinkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RoomlinkResult<()> {
        info!("Coordinator listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("Accepted relayed connection from {}", addr);
                            let coordinator = self.coordinator.clone();
                            tokio::spawn(async move {
                                serve_socket(stream, coordinator).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Coordinator shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn serve_socket(stream: TcpStream, coordinator: Arc<RoomCoordinator>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (connection_id, mut outbound) = coordinator.register_connection();

    let mut forwarder = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {}: {}", message.kind(), e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Coordinator dropped the connection
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!("Connection {} read error: {}", connection_id, e);
                        break;
                    }
                    None => break,
                };
                match frame {
                    Message::Text(text) => match SignalingMessage::decode(&text) {
                        Ok(message) => coordinator.handle_message(connection_id, message),
                        Err(e) => {
                            coordinator.touch(connection_id);
                            coordinator.send_to(
                                connection_id,
                                SignalingMessage::error(error_codes::BAD_FRAME, e.to_string()),
                            );
                        }
                    },
                    Message::Close(_) => break,
                    // Transport-level keepalives still count as activity
                    Message::Ping(_) | Message::Pong(_) => coordinator.touch(connection_id),
                    Message::Binary(_) | Message::Frame(_) => {
                        coordinator.send_to(
                            connection_id,
                            SignalingMessage::error(error_codes::BAD_FRAME, "expected text frame"),
                        );
                    }
                }
            }
            _ = &mut forwarder => break,
        }
    }

    coordinator.disconnect(connection_id);
    forwarder.abort();
    debug!("Connection {} finished", connection_id);
}
