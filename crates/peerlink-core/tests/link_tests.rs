//! Peer link behaviour against real loopback sockets.

use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use peerlink_core::link::{BackoffPolicy, DirectDialer, Frame, LinkState, PeerLink};

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(100))
}

async fn wait_state(rx: &mut watch::Receiver<LinkState>, want: LinkState) {
    timeout(Duration::from_secs(10), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("link never reached {}", want))
        .expect("link task alive");
}

/// Accept one WebSocket session on `listener`, forward every text frame it
/// receives, and hang up when `kill` fires.
fn serve_once(
    listener: TcpListener,
    received: tokio::sync::mpsc::UnboundedSender<String>,
    kill: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(tcp)
            .await
            .expect("server handshake");
        drop(listener);

        tokio::pin!(kill);
        loop {
            tokio::select! {
                _ = &mut kill => break,
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = received.send(text);
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
        // Dropping the socket without a close frame simulates a dead circuit.
        drop(ws);
    })
}

/// A link whose remote dies goes Disconnected, keeps retrying, and comes
/// back once the remote listens again.
#[tokio::test]
async fn test_reconnect_after_remote_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("local addr");

    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    let server = serve_once(listener, frames_tx.clone(), kill_rx);

    let dialer = DirectDialer::new();
    dialer.route("b.onion", addr);
    let link = PeerLink::new("b.onion", Arc::new(dialer), fast_policy());
    let mut state = link.subscribe_state();

    link.connect();
    wait_state(&mut state, LinkState::Connected).await;
    link.send(&Frame::payload("a.onion", "before"))
        .await
        .expect("send while connected");
    assert_eq!(frames_rx.recv().await.as_deref(), Some("FROM:a.onion before"));

    // Kill the remote: listener and session both gone.
    kill_tx.send(()).expect("server running");
    server.await.expect("server task");
    wait_state(&mut state, LinkState::Disconnected).await;
    assert!(!link.is_connected());

    // While down, sends report failure instead of buffering.
    assert!(link.send(&Frame::payload("a.onion", "lost")).await.is_err());

    // Bring the remote back on the same port.
    let listener = TcpListener::bind(addr).await.expect("rebind");
    let (_kill_tx, kill_rx) = oneshot::channel();
    let _server = serve_once(listener, frames_tx, kill_rx);

    wait_state(&mut state, LinkState::Connected).await;
    link.send(&Frame::payload("a.onion", "after"))
        .await
        .expect("send after reconnect");
    assert_eq!(frames_rx.recv().await.as_deref(), Some("FROM:a.onion after"));

    link.disconnect();
    wait_state(&mut state, LinkState::Disconnected).await;
}

/// Disconnect stops a link that is cycling through failed dials.
#[tokio::test]
async fn test_disconnect_stops_retry_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let dialer = DirectDialer::new();
    dialer.route("gone.onion", addr);
    let link = PeerLink::new("gone.onion", Arc::new(dialer), fast_policy());
    let mut state = link.subscribe_state();

    link.connect();
    wait_state(&mut state, LinkState::Disconnected).await;
    link.disconnect();

    // Nothing is listening, but make sure no later attempt flips the state.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(!link.is_connected());
}

/// Frames sent on one session arrive in call order.
#[tokio::test]
async fn test_sends_arrive_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_kill_tx, kill_rx) = oneshot::channel();
    let _server = serve_once(listener, frames_tx, kill_rx);

    let dialer = DirectDialer::new();
    dialer.route("b.onion", addr);
    let link = PeerLink::new("b.onion", Arc::new(dialer), fast_policy());
    let mut state = link.subscribe_state();
    link.connect();
    wait_state(&mut state, LinkState::Connected).await;

    for i in 0..20 {
        link.send(&Frame::payload("a.onion", format!("msg {}", i)))
            .await
            .expect("send");
    }
    for i in 0..20 {
        let text = timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("frame in time")
            .expect("server alive");
        assert_eq!(text, format!("FROM:a.onion msg {}", i));
    }
}
