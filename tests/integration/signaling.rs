// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the `/ws` signaling endpoint.
//!
//! Each test starts an in-process relay on an OS-assigned port and drives it
//! with real WebSocket clients:
//! - join snapshots and `peer-joined` notifications
//! - directed and broadcast relaying of negotiation messages
//! - shared-secret authentication
//! - `peer-left` on leave, disconnect, and session switch
//! - rejection of unknown types, malformed frames and oversized payloads

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rendezvous_proto::{Envelope, EventType, codec};
use rendezvous_relay::config::RelayConfig;
use rendezvous_relay::relay::{self, RelayState};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// How long to wait before concluding that nothing will arrive.
const QUIET: Duration = Duration::from_millis(200);

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay(config: &RelayConfig) -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::with_config(config));
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (addr, state)
}

async fn start_default_relay() -> std::net::SocketAddr {
    start_relay(&RelayConfig::default()).await.0
}

/// A connected signaling client and the socket id the relay assigned it.
struct Peer {
    ws: Client,
    id: String,
}

impl Peer {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect failed");
        let hello = recv_from(&mut ws).await;
        assert_eq!(hello.kind(), &EventType::Status);
        assert_eq!(hello.str_field("state"), Some("connected"));
        let id = hello.str_field("socketId").unwrap().to_string();
        Self { ws, id }
    }

    async fn send(&mut self, envelope: &Envelope) {
        self.ws
            .send(Message::Text(codec::encode_to_string(envelope).into()))
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        recv_from(&mut self.ws).await
    }

    /// Asserts that no data frame arrives within [`QUIET`].
    async fn expect_silence(&mut self) {
        if let Ok(Some(Ok(msg))) = tokio::time::timeout(QUIET, self.ws.next()).await {
            assert!(
                !(msg.is_text() || msg.is_binary()),
                "unexpected frame: {msg:?}"
            );
        }
    }

    async fn join(&mut self, session: &str) -> Envelope {
        self.send(&join(session)).await;
        let joined = self.recv().await;
        assert_eq!(joined.kind(), &EventType::Joined, "got {joined:?}");
        joined
    }
}

async fn recv_from(ws: &mut Client) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if msg.is_text() || msg.is_binary() {
            return codec::decode(&msg.into_data()).expect("relay sent a non-envelope");
        }
    }
}

fn join(session: &str) -> Envelope {
    Envelope::new(EventType::Join).with("sessionId", session)
}

fn offer(sdp: &str) -> Envelope {
    Envelope::new(EventType::Offer).with("payload", json!({ "sdp": sdp }))
}

// =============================================================================
// Join
// =============================================================================

#[tokio::test]
async fn join_snapshot_and_peer_joined() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;

    let joined = c1.join("s1").await;
    assert_eq!(joined.str_field("sessionId"), Some("s1"));
    assert_eq!(joined.str_field("socketId"), Some(c1.id.as_str()));
    assert_eq!(joined.get("participants"), Some(&json!([])));

    let joined = c2.join("s1").await;
    assert_eq!(joined.get("participants"), Some(&json!([c1.id])));

    let notice = c1.recv().await;
    assert_eq!(notice.kind(), &EventType::PeerJoined);
    assert_eq!(notice.str_field("sessionId"), Some("s1"));
    assert_eq!(notice.str_field("socketId"), Some(c2.id.as_str()));

    c2.expect_silence().await;
}

#[tokio::test]
async fn third_joiner_sees_both_members() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    let mut c3 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;

    let joined = c3.join("s1").await;
    let mut expected = vec![c1.id.clone(), c2.id.clone()];
    expected.sort();
    assert_eq!(joined.get("participants"), Some(&json!(expected)));
}

#[tokio::test]
async fn sessions_are_isolated() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;

    let joined = c2.join("s2").await;
    assert_eq!(joined.get("participants"), Some(&json!([])));
    c1.expect_silence().await;

    c2.send(&offer("X")).await;
    c1.expect_silence().await;
}

#[tokio::test]
async fn join_without_session_id_is_an_error() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;

    c1.send(&Envelope::new(EventType::Join)).await;
    let err = c1.recv().await;
    assert_eq!(err.kind(), &EventType::Error);
    assert_eq!(err.str_field("message"), Some("missing sessionId"));
}

// =============================================================================
// Relaying
// =============================================================================

#[tokio::test]
async fn directed_offer_reaches_only_target() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    let mut c3 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await; // peer-joined c2
    c3.join("s1").await;
    c1.recv().await; // peer-joined c3
    c2.recv().await; // peer-joined c3

    let directed = offer("X")
        .with("sessionId", "s1")
        .with("targetConnId", c2.id.as_str());
    c1.send(&directed).await;

    let received = c2.recv().await;
    assert_eq!(received.kind(), &EventType::Offer);
    assert_eq!(received.str_field("from"), Some(c1.id.as_str()));
    assert_eq!(received.get("payload"), Some(&json!({ "sdp": "X" })));
    assert!(received.get("targetConnId").is_none());

    c1.expect_silence().await;
    c3.expect_silence().await;
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_sender() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    let mut c3 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;
    c3.join("s1").await;
    c1.recv().await;
    c2.recv().await;

    let candidate = Envelope::new(EventType::Candidate).with("payload", json!({ "candidate": "c0" }));
    c1.send(&candidate).await;

    for peer in [&mut c2, &mut c3] {
        let got = peer.recv().await;
        assert_eq!(got.kind(), &EventType::Candidate);
        assert_eq!(got.str_field("from"), Some(c1.id.as_str()));
        assert_eq!(got.str_field("sessionId"), Some("s1"));
    }
    c1.expect_silence().await;
}

#[tokio::test]
async fn answer_round_trip_between_two_peers() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;

    c1.send(&offer("O").with("targetConnId", c2.id.as_str())).await;
    let got = c2.recv().await;
    let reply_to = got.str_field("from").unwrap().to_string();

    let answer = Envelope::new(EventType::Answer)
        .with("payload", json!({ "sdp": "A" }))
        .with("targetConnId", reply_to);
    c2.send(&answer).await;
    let got = c1.recv().await;
    assert_eq!(got.kind(), &EventType::Answer);
    assert_eq!(got.str_field("from"), Some(c2.id.as_str()));
}

#[tokio::test]
async fn offer_to_foreign_session_is_dropped() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s2").await;

    c1.send(&offer("X").with("sessionId", "s2")).await;
    c2.expect_silence().await;
    c1.expect_silence().await;
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn wrong_secret_rejected_without_state_change() {
    let config = RelayConfig {
        shared_secret: Some("hunter2".to_string()),
        ..RelayConfig::default()
    };
    let (addr, state) = start_relay(&config).await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;

    c1.send(&join("s1").with("secret", "hunter2")).await;
    assert_eq!(c1.recv().await.kind(), &EventType::Joined);

    c2.send(&join("s1").with("secret", "wrong")).await;
    let err = c2.recv().await;
    assert_eq!(err.kind(), &EventType::Error);
    assert_eq!(err.str_field("message"), Some("invalid secret"));

    c1.expect_silence().await;
    assert_eq!(state.dispatcher().members("s1").len(), 1);
}

// =============================================================================
// Departure
// =============================================================================

#[tokio::test]
async fn leave_notifies_remaining_member() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;

    c2.send(&Envelope::new(EventType::Leave)).await;
    let notice = c1.recv().await;
    assert_eq!(notice.kind(), &EventType::PeerLeft);
    assert_eq!(notice.str_field("socketId"), Some(c2.id.as_str()));

    // c2 is no longer a member, so its offers go nowhere.
    c2.send(&offer("late")).await;
    c1.expect_silence().await;
}

#[tokio::test]
async fn disconnect_notifies_and_cleans_up() {
    let (addr, state) = start_relay(&RelayConfig::default()).await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;

    let c2_id = c2.id.clone();
    c2.ws.close(None).await.unwrap();
    drop(c2);

    let notice = c1.recv().await;
    assert_eq!(notice.kind(), &EventType::PeerLeft);
    assert_eq!(notice.str_field("socketId"), Some(c2_id.as_str()));

    c1.ws.close(None).await.unwrap();
    drop(c1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.dispatcher().connection_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "connections not cleaned up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.dispatcher().session_count(), 0);
}

#[tokio::test]
async fn switching_sessions_announces_departure() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    let mut c3 = Peer::connect(addr).await;
    c1.join("old").await;
    c2.join("old").await;
    c1.recv().await;
    c3.join("new").await;

    let joined = c2.join("new").await;
    assert_eq!(joined.get("participants"), Some(&json!([c3.id])));

    let left = c1.recv().await;
    assert_eq!(left.kind(), &EventType::PeerLeft);
    assert_eq!(left.str_field("sessionId"), Some("old"));

    let arrived = c3.recv().await;
    assert_eq!(arrived.kind(), &EventType::PeerJoined);
    assert_eq!(arrived.str_field("sessionId"), Some("new"));
}

#[tokio::test]
async fn rejoin_same_session_is_quiet_for_others() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;

    let again = c2.join("s1").await;
    assert_eq!(again.get("participants"), Some(&json!([c1.id])));
    c1.expect_silence().await;
}

// =============================================================================
// Rejected input
// =============================================================================

#[tokio::test]
async fn unknown_type_and_garbage_are_ignored() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;

    c1.send(&Envelope::new(EventType::from("wave")).with("sessionId", "s1"))
        .await;
    c1.send_raw("not json at all").await;
    c1.send_raw(r#"{"no":"type"}"#).await;
    c1.send_raw(r#"{"type":7}"#).await;
    c2.expect_silence().await;
    c1.expect_silence().await;

    // The connection is still usable afterwards.
    c1.send(&offer("still-here")).await;
    assert_eq!(c2.recv().await.kind(), &EventType::Offer);
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    let addr = start_default_relay().await;
    let mut c1 = Peer::connect(addr).await;

    c1.ws
        .send(Message::Binary(codec::encode(&join("s1")).into()))
        .await
        .unwrap();
    assert_eq!(c1.recv().await.kind(), &EventType::Joined);
}

#[tokio::test]
async fn oversized_payload_rejected() {
    let config = RelayConfig {
        max_payload_size: 1024,
        ..RelayConfig::default()
    };
    let (addr, _state) = start_relay(&config).await;
    let mut c1 = Peer::connect(addr).await;
    let mut c2 = Peer::connect(addr).await;
    c1.join("s1").await;
    c2.join("s1").await;
    c1.recv().await;

    c1.send(&offer(&"x".repeat(2048))).await;
    let err = c1.recv().await;
    assert_eq!(err.kind(), &EventType::Error);
    assert!(err.str_field("message").unwrap().starts_with("payload too large"));
    c2.expect_silence().await;
}
