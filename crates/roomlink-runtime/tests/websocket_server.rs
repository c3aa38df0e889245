//! Coordinator served over real WebSocket sockets on loopback

use futures::{SinkExt, StreamExt};
use roomlink_core::{
    protocol::{error_codes, leave_reasons},
    ChatMessage, CoordinatorConfig, PeerId, RoomId, SignalingMessage, SystemTimeSource, Timestamp,
};
use roomlink_runtime::{
    CoordinatorServer, RelayConnection, RelayConnector, RoomCoordinator, WebSocketRelay,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

fn create_test_peer_id(id: u8) -> PeerId {
    PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
}

async fn start_server() -> (SocketAddr, watch::Sender<bool>) {
    let coordinator = Arc::new(RoomCoordinator::new(
        CoordinatorConfig::default(),
        Arc::new(SystemTimeSource::new()),
    ));
    let server = CoordinatorServer::bind("127.0.0.1:0", coordinator)
        .await
        .expect("bind loopback");
    let addr = server.local_addr().expect("bound address");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));
    (addr, shutdown_tx)
}

async fn connect(addr: SocketAddr) -> RelayConnection {
    WebSocketRelay::new(format!("ws://{addr}"))
        .connect()
        .await
        .expect("websocket connect")
}

/// Next inbound message matching `wanted`, skipping everything else
async fn next_matching<F>(connection: &mut RelayConnection, mut wanted: F) -> SignalingMessage
where
    F: FnMut(&SignalingMessage) -> bool,
{
    timeout(WAIT, async {
        loop {
            let message = connection.inbound.recv().await.expect("socket open");
            if wanted(&message) {
                return message;
            }
        }
    })
    .await
    .expect("message in time")
}

fn join(connection: &RelayConnection, peer_id: PeerId, display_name: &str) {
    connection
        .outbound
        .send(SignalingMessage::JoinRoom {
            room_id: RoomId::new("lobby").unwrap(),
            peer_id,
            display_name: display_name.into(),
        })
        .unwrap();
}

#[tokio::test]
async fn test_chat_round_trip_over_websocket() {
    let (addr, _shutdown) = start_server().await;
    let ann = create_test_peer_id(1);
    let bob = create_test_peer_id(2);
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    join(&a, ann, "ann");
    next_matching(&mut a, |m| matches!(m, SignalingMessage::Roster { .. })).await;
    join(&b, bob, "bob");
    match next_matching(&mut b, |m| matches!(m, SignalingMessage::Roster { .. })).await {
        SignalingMessage::Roster { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, ann);
        }
        other => panic!("unexpected {other:?}"),
    }
    next_matching(&mut a, |m| {
        matches!(m, SignalingMessage::PeerJoined { peer_id, .. } if *peer_id == bob)
    })
    .await;

    let message = ChatMessage::new(
        RoomId::new("lobby").unwrap(),
        ann,
        "ann",
        "hello over the wire",
        Timestamp::new(1),
    );
    let id = message.id;
    a.outbound
        .send(SignalingMessage::ChatMessage {
            room_id: RoomId::new("lobby").unwrap(),
            message,
        })
        .unwrap();

    match next_matching(&mut b, |m| matches!(m, SignalingMessage::ChatMessage { .. })).await {
        SignalingMessage::ChatMessage { message, .. } => {
            assert_eq!(message.id, id);
            assert_eq!(message.content, "hello over the wire");
            assert!(message.delivered_at.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
    // Sender gets its own echo and the acknowledgement
    next_matching(&mut a, |m| {
        matches!(m, SignalingMessage::ChatMessage { message, .. } if message.id == id)
    })
    .await;
    next_matching(&mut a, |m| {
        matches!(m, SignalingMessage::DeliveryAck { message_id, .. } if *message_id == id)
    })
    .await;
}

#[tokio::test]
async fn test_malformed_text_frame_gets_bad_frame_error() {
    let (addr, _shutdown) = start_server().await;
    let (mut socket, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("raw websocket connect");

    socket
        .send(Message::Text("{\"type\": \"no-such-thing\"".into()))
        .await
        .unwrap();

    let reply = timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return SignalingMessage::decode(&text).expect("coordinator frames decode")
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("reply in time");
    assert!(matches!(
        reply,
        SignalingMessage::Error { code, .. } if code == error_codes::BAD_FRAME
    ));
}

#[tokio::test]
async fn test_closed_socket_is_announced_as_departure() {
    let (addr, shutdown) = start_server().await;
    let ann = create_test_peer_id(1);
    let bob = create_test_peer_id(2);
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    join(&a, ann, "ann");
    next_matching(&mut a, |m| matches!(m, SignalingMessage::Roster { .. })).await;
    join(&b, bob, "bob");
    next_matching(&mut b, |m| matches!(m, SignalingMessage::Roster { .. })).await;

    // Dropping the outbound side closes the socket
    drop(b);

    match next_matching(&mut a, |m| matches!(m, SignalingMessage::PeerLeft { .. })).await {
        SignalingMessage::PeerLeft {
            peer_id, reason, ..
        } => {
            assert_eq!(peer_id, bob);
            assert_eq!(reason, leave_reasons::DISCONNECTED);
        }
        other => panic!("unexpected {other:?}"),
    }
    shutdown.send(true).unwrap();
}
