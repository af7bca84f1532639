use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use beach_lens::config::SignalingConfig;
use beach_lens::protocol::{Envelope, kind};
use beach_lens::transport::{ConnectionState, SignalingTransport, WebSocketDialer};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Server side of one accepted socket as seen by the test.
struct Peer {
    received: mpsc::UnboundedReceiver<WsMessage>,
    push: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Clone)]
struct Relay {
    accepted: mpsc::UnboundedSender<Peer>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, relay))
}

async fn serve_socket(socket: WebSocket, relay: Relay) {
    let (received_tx, received) = mpsc::unbounded_channel();
    let (push, mut push_rx) = mpsc::unbounded_channel();
    if relay.accepted.send(Peer { received, push }).is_err() {
        return;
    }
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => {
                    let closing = matches!(message, WsMessage::Close(_));
                    let _ = received_tx.send(message);
                    if closing {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            },
            outgoing = push_rx.recv() => match outgoing {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                // Test dropped the peer: vanish without a close handshake.
                None => break,
            },
        }
    }
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Peer>) {
    let (accepted, accepted_rx) = mpsc::unbounded_channel();
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Relay { accepted });
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind signaling listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    // http scheme exercises the ws rewrite in the dialer.
    (format!("http://{addr}/ws"), accepted_rx)
}

fn transport(url: &str) -> SignalingTransport {
    let config = SignalingConfig {
        url: url.to_string(),
        base_delay_ms: 50,
        max_reconnect: 5,
        open_timeout_ms: 2_000,
        inbound_capacity: 16,
    };
    SignalingTransport::new(&config, Arc::new(WebSocketDialer))
}

async fn wait_for(transport: &SignalingTransport, target: ConnectionState) {
    transport
        .watch_state()
        .wait_for(|state| *state == target)
        .await
        .expect("state channel closed");
}

async fn next_envelope(peer: &mut Peer) -> Envelope {
    loop {
        match peer.received.recv().await.expect("peer closed") {
            WsMessage::Text(text) => return serde_json::from_str(&text).expect("valid envelope"),
            WsMessage::Binary(bytes) => {
                return serde_json::from_slice(&bytes).expect("valid envelope");
            }
            _ => continue,
        }
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_queued_while_disconnected_is_transmitted_once() {
    let (url, mut accepted) = spawn_server().await;
    let transport = transport(&url);

    transport.send(Envelope::offer("cus-7", "v=0 offer"));
    assert_eq!(transport.queued(), 1);

    transport.connect();
    let mut peer = accepted.recv().await.expect("connection accepted");
    let envelope = next_envelope(&mut peer).await;
    assert_eq!(envelope, Envelope::offer("cus-7", "v=0 offer"));
    wait_for(&transport, ConnectionState::Connected).await;
    assert_eq!(transport.queued(), 0);

    let duplicate = tokio::time::timeout(Duration::from_millis(200), peer.received.recv()).await;
    assert!(duplicate.is_err(), "offer transmitted more than once");
}

#[test_timeout::tokio_timeout_test(10)]
async fn inbound_frames_are_decoded_and_broadcast() {
    let (url, mut accepted) = spawn_server().await;
    let transport = transport(&url);
    let mut first = transport.subscribe();
    let mut second = transport.subscribe();

    transport.connect();
    let peer = accepted.recv().await.expect("connection accepted");
    peer.push.send(WsMessage::Text("not json".into())).unwrap();
    let answer = json!({ "type": kind::ANSWER, "id": "dev-42", "value": "v=0 answer" });
    peer.push.send(WsMessage::Text(answer.to_string())).unwrap();

    for receiver in [&mut first, &mut second] {
        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.kind, kind::ANSWER);
        assert_eq!(envelope.id, "dev-42");
    }
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn dropped_socket_reconnects_and_flushes_backlog() {
    let (url, mut accepted) = spawn_server().await;
    let transport = transport(&url);
    transport.connect();
    let peer = accepted.recv().await.expect("first connection");
    wait_for(&transport, ConnectionState::Connected).await;

    drop(peer);
    wait_for(&transport, ConnectionState::Disconnected).await;
    transport.send(Envelope::recording("cus-3", true));

    let mut peer = accepted.recv().await.expect("second connection");
    let envelope = next_envelope(&mut peer).await;
    assert_eq!(envelope.kind, kind::START_RECORDING);
    wait_for(&transport, ConnectionState::Connected).await;
    assert_eq!(transport.reconnect_attempt(), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_sends_normal_closure_and_stays_down() {
    let (url, mut accepted) = spawn_server().await;
    let transport = transport(&url);
    transport.connect();
    let mut peer = accepted.recv().await.expect("connection accepted");
    wait_for(&transport, ConnectionState::Connected).await;

    transport.close();
    let frame = loop {
        match peer.received.recv().await.expect("close frame") {
            WsMessage::Close(frame) => break frame,
            _ => continue,
        }
    };
    assert_eq!(frame.map(|frame| frame.code), Some(1000));

    let reconnect = tokio::time::timeout(Duration::from_millis(500), accepted.recv()).await;
    assert!(reconnect.is_err(), "transport reconnected after close");
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}
