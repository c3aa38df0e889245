//! TCP direct transport
//!
//! Frames are bincode bodies behind a 4-byte big-endian length prefix. The
//! dialer's first frame is `hello`, which tells the listener who is on the
//! other end before the link is handed to the client.

use async_trait::async_trait;
use roomlink_core::{
    protocol::{decode_frame_body, encode_frame, frame_len, FRAME_HEADER_LEN},
    PeerFrame, PeerId, RoomId, RoomlinkError, RoomlinkResult,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DirectLink, DirectTransport, IncomingLinks};

/// Time a freshly accepted socket has to send its `hello`
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Direct transport over plain TCP
#[derive(Debug, Clone)]
pub struct TcpDirectTransport {
    local_addr: SocketAddr,
}

impl TcpDirectTransport {
    /// Listen on `addr` and start accepting links
    pub async fn bind(addr: &str) -> RoomlinkResult<(Self, IncomingLinks)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        info!("Direct transport listening on {}", local_addr);

        tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Direct accept error: {}", e);
                        continue;
                    }
                };
                let incoming = incoming_tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(HELLO_TIMEOUT, accept_link(stream)).await {
                        Ok(Ok(link)) => {
                            let _ = incoming.send(link);
                        }
                        Ok(Err(e)) => debug!("Rejected direct link from {}: {}", remote_addr, e),
                        Err(_) => debug!("Direct link from {} sent no hello", remote_addr),
                    }
                });
                if incoming_tx.is_closed() {
                    break;
                }
            }
        });

        Ok((Self { local_addr }, incoming_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> RoomlinkResult<PeerFrame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame_body(&body)
}

async fn accept_link(stream: TcpStream) -> RoomlinkResult<DirectLink> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let remote = match read_frame(&mut reader).await? {
        PeerFrame::Hello { peer_id, .. } => peer_id,
        other => {
            return Err(RoomlinkError::invalid_message(format!(
                "expected hello, got {}",
                other.kind()
            )))
        }
    };
    Ok(wire_link(remote, reader, writer))
}

/// Spawn the reader and writer tasks for an established socket
fn wire_link(remote: PeerId, mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) -> DirectLink {
    let (outbound, mut to_socket) = mpsc::unbounded_channel::<PeerFrame>();
    let (from_socket, inbound) = mpsc::unbounded_channel::<PeerFrame>();

    tokio::spawn(async move {
        while let Some(frame) = to_socket.recv().await {
            let bytes = match encode_frame(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping unencodable {} frame: {}", frame.kind(), e);
                    continue;
                }
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if from_socket.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Direct link to {} closed: {}", remote.short(), e);
                    break;
                }
            }
        }
    });

    DirectLink {
        remote,
        outbound,
        inbound,
    }
}

#[async_trait]
impl DirectTransport for TcpDirectTransport {
    fn address(&self) -> String {
        self.local_addr.to_string()
    }

    async fn dial(
        &self,
        local: PeerId,
        room_id: &RoomId,
        address: &str,
        remote: PeerId,
    ) -> RoomlinkResult<DirectLink> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let link = wire_link(remote, reader, writer);
        link.outbound
            .send(PeerFrame::Hello {
                peer_id: local,
                room_id: room_id.clone(),
            })
            .map_err(|_| RoomlinkError::channel_error("direct link writer stopped"))?;
        debug!("Dialed {} at {}", remote.short(), address);
        Ok(link)
    }
}
