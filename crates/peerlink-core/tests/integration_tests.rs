//! End-to-end scenarios for peerlink nodes.
//!
//! Two nodes run in one process on loopback sockets. The transport is
//! simulated through watch channels and links dial directly instead of
//! through a SOCKS proxy.

use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use peerlink_core::config::{LinkConfig, NodeConfig, OutboxConfig};
use peerlink_core::crypto::{ChaChaCipher, PayloadCipher, PlaintextCipher, StaticKeypair};
use peerlink_core::handshake::{HandshakeCoordinator, HandshakePhase, SqliteHandshakeStore};
use peerlink_core::link::{ConnectionStatus, DirectDialer, Frame};
use peerlink_core::messaging::{NodeEvent, PeerNode};
use peerlink_core::storage::{Database, Outbox};
use peerlink_core::tor::TransportSnapshot;

const A: &str = "a.onion";
const B: &str = "b.onion";

fn test_config() -> NodeConfig {
    NodeConfig {
        link: LinkConfig {
            backoff_step_ms: 20,
            backoff_cap_ms: 200,
            health_check_ms: 100,
            dial_timeout_secs: 5,
        },
        outbox: OutboxConfig {
            drain_interval_ms: 200,
        },
        ..Default::default()
    }
}

fn plaintext() -> Arc<dyn PayloadCipher> {
    Arc::new(PlaintextCipher)
}

fn chacha() -> Arc<dyn PayloadCipher> {
    Arc::new(ChaChaCipher)
}

struct TestNode {
    node: Arc<PeerNode>,
    dialer: Arc<DirectDialer>,
    transport: watch::Sender<TransportSnapshot>,
    events: broadcast::Receiver<NodeEvent>,
    bound: SocketAddr,
}

async fn spawn_node(cipher: Arc<dyn PayloadCipher>) -> TestNode {
    let (transport, rx) = watch::channel(TransportSnapshot::stopped());
    let dialer = Arc::new(DirectDialer::new());
    let node = PeerNode::with_parts(
        test_config(),
        SocketAddr::from(([127, 0, 0, 1], 0)),
        dialer.clone(),
        rx,
        Database::open_in_memory().expect("open database"),
        cipher,
    )
    .expect("build node");
    let events = node.subscribe();
    let bound = node.start().await.expect("start node");
    TestNode {
        node,
        dialer,
        transport,
        events,
        bound,
    }
}

/// Wait for the first event matching `pred`.
async fn wait_event<F>(events: &mut broadcast::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event in time")
}

async fn wait_connected(node: &PeerNode) {
    timeout(Duration::from_secs(10), async {
        while node.connection_status() != ConnectionStatus::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("link connected in time");
}

/// Bring up two nodes so that B's link to A is up before A starts the
/// handshake, then wait for both sides to complete it.
async fn connected_pair(cipher: fn() -> Arc<dyn PayloadCipher>) -> (TestNode, TestNode) {
    let mut a = spawn_node(cipher()).await;
    let mut b = spawn_node(cipher()).await;

    a.dialer.route(B, b.bound);
    b.dialer.route(A, a.bound);
    a.node.open_conversation(B);
    b.node.open_conversation(A);

    // B goes first; as the higher address it waits for A's key.
    b.transport.send_replace(TransportSnapshot::ready(B));
    wait_connected(&b.node).await;
    assert_eq!(b.node.handshake_phase(A).expect("phase"), HandshakePhase::NotStarted);

    a.transport.send_replace(TransportSnapshot::ready(A));

    wait_event(&mut a.events, |e| {
        matches!(e, NodeEvent::HandshakeComplete { peer } if peer == B)
    })
    .await;
    wait_event(&mut b.events, |e| {
        matches!(e, NodeEvent::HandshakeComplete { peer } if peer == A)
    })
    .await;

    (a, b)
}

/// Both nodes derive the same secret from exactly one exchange, and a
/// queued message reaches the other side attributed to its sender.
#[tokio::test]
async fn test_two_node_exchange() {
    let (a, mut b) = connected_pair(plaintext).await;

    let secret_a = a.node.shared_secret(B).expect("read").expect("a has secret");
    let secret_b = b.node.shared_secret(A).expect("read").expect("b has secret");
    assert_eq!(secret_a, secret_b);
    assert_eq!(a.node.handshake_phase(B).expect("phase"), HandshakePhase::Complete);
    assert_eq!(b.node.handshake_phase(A).expect("phase"), HandshakePhase::Complete);

    let mut a_events = a.node.subscribe();
    let id = a.node.send_message(B, "hello").expect("send");

    let received = wait_event(&mut b.events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
    match received {
        NodeEvent::MessageReceived { from, body, .. } => {
            assert_eq!(from, A);
            assert_eq!(body, "hello");
        }
        other => panic!("unexpected event {:?}", other),
    }

    wait_event(&mut a_events, |e| {
        matches!(e, NodeEvent::MessageDelivered { id: delivered, .. } if *delivered == id)
    })
    .await;
    let stats = a.node.outbox_stats().expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.sent, 1);

    let history = b.node.history(A, 10).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body, "hello");
    assert!(!history[0].outgoing);

    a.node.shutdown().await;
    b.node.shutdown().await;
}

/// With the encrypting cipher the payload travels sealed and still
/// decrypts on the other side.
#[tokio::test]
async fn test_two_node_exchange_encrypted() {
    let (a, mut b) = connected_pair(chacha).await;

    a.node.send_message(B, "sealed hello").expect("send");
    let received = wait_event(&mut b.events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
    assert!(matches!(
        received,
        NodeEvent::MessageReceived { ref body, .. } if body == "sealed hello"
    ));

    a.node.shutdown().await;
    b.node.shutdown().await;
}

/// The initiator's link comes up before the responder has any link of its
/// own. The responder's reply waits until its link is up, then both sides
/// converge.
#[tokio::test]
async fn test_handshake_when_initiator_ready_first() {
    let mut a = spawn_node(plaintext()).await;
    let mut b = spawn_node(plaintext()).await;
    a.dialer.route(B, b.bound);
    b.dialer.route(A, a.bound);
    a.node.open_conversation(B);
    b.node.open_conversation(A);

    a.transport.send_replace(TransportSnapshot::ready(A));
    wait_connected(&a.node).await;

    // B hears A's key on its listener before it can dial anyone.
    wait_event(&mut b.events, |e| {
        matches!(e, NodeEvent::HandshakeComplete { peer } if peer == A)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.node.handshake_phase(B).expect("phase"), HandshakePhase::Sent);

    b.transport.send_replace(TransportSnapshot::ready(B));
    wait_event(&mut a.events, |e| {
        matches!(e, NodeEvent::HandshakeComplete { peer } if peer == B)
    })
    .await;

    assert_eq!(a.node.handshake_phase(B).expect("phase"), HandshakePhase::Complete);
    assert_eq!(
        a.node.shared_secret(B).expect("read"),
        b.node.shared_secret(A).expect("read")
    );

    a.node.shutdown().await;
    b.node.shutdown().await;
}

/// Message text that looks like a handshake key is delivered as text and
/// leaves the agreed secret alone.
#[tokio::test]
async fn test_key_shaped_message_is_delivered() {
    let (a, mut b) = connected_pair(plaintext).await;
    let before = b.node.shared_secret(A).expect("read");

    let text = format!(
        "ECDH_PUBLIC_KEY:{}",
        StaticKeypair::generate().public_key().to_base64()
    );
    a.node.send_message(B, &text).expect("send");

    let received = wait_event(&mut b.events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
    assert!(matches!(
        received,
        NodeEvent::MessageReceived { ref from, ref body, .. } if from == A && *body == text
    ));
    assert_eq!(b.node.shared_secret(A).expect("read"), before);

    a.node.shutdown().await;
    b.node.shutdown().await;
}

/// A stranger connecting to the listener with its own key cannot replace
/// the secret already agreed with the active peer.
#[tokio::test]
async fn test_stranger_key_does_not_replace_secret() {
    let (a, mut b) = connected_pair(plaintext).await;
    let before = b.node.shared_secret(A).expect("read");

    let (mut stranger, _) = tokio_tungstenite::connect_async(format!("ws://{}/", b.bound))
        .await
        .expect("connect to listener");
    let frame = Frame::handshake(StaticKeypair::generate().public_key().to_base64());
    stranger
        .send(Message::Text(frame.encode()))
        .await
        .expect("send frame");

    wait_event(&mut b.events, |e| matches!(e, NodeEvent::FrameDiscarded { .. })).await;
    assert_eq!(b.node.shared_secret(A).expect("read"), before);
    assert_eq!(b.node.handshake_phase(A).expect("phase"), HandshakePhase::Complete);

    a.node.shutdown().await;
    b.node.shutdown().await;
}

/// A message queued while the link is down goes out once it comes up.
#[tokio::test]
async fn test_queued_message_delivered_after_link_returns() {
    let (a, mut b) = connected_pair(plaintext).await;

    // Transport drops: A's link is torn down.
    a.transport.send_replace(TransportSnapshot::stopped());
    timeout(Duration::from_secs(5), async {
        while a.node.connection_status() == ConnectionStatus::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("link dropped");

    a.node.send_message(B, "while offline").expect("durable send");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.node.outbox_stats().expect("stats").pending, 1);

    a.transport.send_replace(TransportSnapshot::ready(A));
    let received = wait_event(&mut b.events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
    assert!(matches!(
        received,
        NodeEvent::MessageReceived { ref body, .. } if body == "while offline"
    ));

    timeout(Duration::from_secs(5), async {
        while a.node.outbox_stats().expect("stats").pending != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("entry marked sent");

    a.node.shutdown().await;
    b.node.shutdown().await;
}

/// An enqueue that is never delivered survives a restart as pending, and
/// marking it delivered twice is harmless.
#[test]
fn test_outbox_survives_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("peerlink.db");

    let id = {
        let outbox = Outbox::open(&path).expect("open outbox");
        outbox.enqueue(A, B, b"hello").expect("enqueue")
    };

    let outbox = Outbox::open(&path).expect("reopen outbox");
    let pending = outbox.drain_pending().expect("drain");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert!(!pending[0].sent);

    outbox.mark_delivered(id).expect("first mark");
    outbox.mark_delivered(id).expect("second mark");
    assert!(outbox.get(id).expect("get").expect("entry").sent);
    assert!(outbox.drain_pending().expect("drain").is_empty());
}

/// Handshake state in the node database survives reopening it.
#[test]
fn test_handshake_state_survives_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("peerlink.db");

    let responder = HandshakeCoordinator::new(Arc::new(
        SqliteHandshakeStore::open_in_memory().expect("store"),
    ));

    let secret = {
        let db = Database::open_path(&path).expect("open database");
        let store = SqliteHandshakeStore::from_connection(db.connection()).expect("store");
        let initiator = HandshakeCoordinator::new(Arc::new(store));

        let first = initiator.on_connected(A, B).expect("connect").expect("initiates");
        let Frame::Handshake { public_key } = first else {
            panic!("expected handshake frame");
        };
        let outcome = responder.on_handshake_frame(A, &public_key).expect("respond");
        let Some(Frame::Handshake { public_key }) = outcome.reply else {
            panic!("expected reply");
        };
        initiator.on_handshake_frame(B, &public_key).expect("complete").secret
    };

    let db = Database::open_path(&path).expect("reopen database");
    let store = SqliteHandshakeStore::from_connection(db.connection()).expect("store");
    let restored = HandshakeCoordinator::new(Arc::new(store));
    assert_eq!(restored.phase(B).expect("phase"), HandshakePhase::Complete);
    assert_eq!(restored.shared_secret(B).expect("secret"), Some(secret));
}
