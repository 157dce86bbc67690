//! Self-healing outbound link to one remote peer.
//!
//! A [`PeerLink`] is a handle to a single connection task that owns the
//! stream. The task dials, pumps frames in both directions and, while
//! reconnection is enabled, redials with [`BackoffPolicy`] after any drop.
//! Other components only talk to it through the command channel and read
//! its state from a `watch` channel.

use super::backoff::BackoffPolicy;
use super::dialer::{Dialer, LinkStream};
use super::frame::Frame;
use crate::error::{Error, Result};
use crate::logging::RedactedAddress;
use futures_util::{SinkExt, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Connection state of a [`PeerLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, not yet connecting.
    Idle,
    /// Dial in progress.
    Connecting,
    /// Stream open; sends are delivered.
    Connected,
    /// Stream lost, or the link was shut down with `disconnect`.
    Disconnected,
    /// Dial failed or stream lost on a link built with reconnection
    /// turned off (see [`PeerLink::with_reconnect`]).
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

enum LinkCommand {
    Send(String, oneshot::Sender<Result<()>>),
    Disconnect,
}

/// Inbound frames of one link, across all of its reconnects.
pub struct InboundFrames {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl InboundFrames {
    /// Next frame, or `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Stream for InboundFrames {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle to the connection task for one remote address.
pub struct PeerLink {
    address: String,
    dialer: Arc<dyn Dialer>,
    policy: BackoffPolicy,
    reconnect: bool,
    state: Arc<watch::Sender<LinkState>>,
    should_reconnect: Arc<AtomicBool>,
    started: AtomicBool,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkCommand>>>,
    inbox_tx: mpsc::UnboundedSender<Frame>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

impl PeerLink {
    /// Create an idle link to `address`.
    pub fn new(address: impl Into<String>, dialer: Arc<dyn Dialer>, policy: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        Self {
            address: address.into(),
            dialer,
            policy,
            reconnect: true,
            state: Arc::new(state),
            should_reconnect: Arc::new(AtomicBool::new(true)),
            started: AtomicBool::new(false),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        }
    }

    /// Whether to redial after a failed dial or a lost stream. With
    /// reconnection off, the first failure leaves the link [`LinkState::Failed`].
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Remote address this link dials.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Launch the connection task. No-op if already launched or after
    /// [`disconnect`](Self::disconnect).
    pub fn connect(&self) {
        if !self.should_reconnect.load(Ordering::SeqCst) {
            debug!(peer = %RedactedAddress(&self.address), "Connect after disconnect ignored");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(commands) = take(&self.cmd_rx) else {
            return;
        };

        let task = ConnectionTask {
            address: self.address.clone(),
            dialer: Arc::clone(&self.dialer),
            policy: self.policy,
            reconnect: self.reconnect,
            state: Arc::clone(&self.state),
            should_reconnect: Arc::clone(&self.should_reconnect),
            inbox: self.inbox_tx.clone(),
            commands,
        };
        tokio::spawn(task.run());
    }

    /// Send one frame. Fails with [`Error::Delivery`] unless connected; the
    /// frame is never buffered.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Delivery("link not connected".into()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Send(frame.encode(), reply_tx))
            .map_err(|_| Error::Delivery("link closed".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Delivery("link closed before send completed".into()))?
    }

    /// Take the inbound frame stream. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<InboundFrames> {
        take(&self.inbox_rx).map(|rx| InboundFrames { rx })
    }

    /// Whether sends are currently delivered.
    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == LinkState::Connected
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Disable reconnection and tear down the stream. Final.
    pub fn disconnect(&self) {
        if self.should_reconnect.swap(false, Ordering::SeqCst) {
            debug!(peer = %RedactedAddress(&self.address), "Disconnecting link");
        }
        if self.cmd_tx.send(LinkCommand::Disconnect).is_err() || !self.started.load(Ordering::SeqCst) {
            self.state.send_replace(LinkState::Disconnected);
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(LinkCommand::Disconnect);
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("address", &RedactedAddress(&self.address))
            .field("state", &self.state())
            .finish()
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// How a connected session ended.
enum SessionEnd {
    Lost(String),
    Disconnect,
}

struct ConnectionTask {
    address: String,
    dialer: Arc<dyn Dialer>,
    policy: BackoffPolicy,
    reconnect: bool,
    state: Arc<watch::Sender<LinkState>>,
    should_reconnect: Arc<AtomicBool>,
    inbox: mpsc::UnboundedSender<Frame>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if !self.reconnect_enabled() {
                break;
            }

            self.state.send_replace(LinkState::Connecting);
            let Some(result) = self.dial().await else {
                self.state.send_replace(LinkState::Disconnected);
                return;
            };

            match result {
                Ok(stream) => {
                    attempt = 0;
                    info!(peer = %RedactedAddress(&self.address), "Link connected");
                    self.state.send_replace(LinkState::Connected);

                    match self.session(stream).await {
                        SessionEnd::Disconnect => {
                            self.state.send_replace(LinkState::Disconnected);
                            info!(peer = %RedactedAddress(&self.address), "Link disconnected");
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(peer = %RedactedAddress(&self.address), %reason, "Link lost");
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %RedactedAddress(&self.address), error = %e, "Dial failed");
                }
            }

            if !self.reconnect_enabled() {
                break;
            }
            if !self.reconnect {
                self.state.send_replace(LinkState::Failed);
                return;
            }

            attempt = attempt.saturating_add(1);
            self.state.send_replace(LinkState::Disconnected);
            let delay = self.policy.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            if !self.wait(delay).await {
                self.state.send_replace(LinkState::Disconnected);
                return;
            }
        }

        // Only `disconnect` clears the flag.
        self.state.send_replace(LinkState::Disconnected);
    }

    fn reconnect_enabled(&self) -> bool {
        self.should_reconnect.load(Ordering::SeqCst)
    }

    /// Dial while still answering commands. `None` on disconnect.
    async fn dial(&mut self) -> Option<Result<LinkStream>> {
        let dialer = Arc::clone(&self.dialer);
        let dial = dialer.dial(&self.address);
        tokio::pin!(dial);

        loop {
            tokio::select! {
                result = &mut dial => return Some(result),
                cmd = self.commands.recv() => {
                    if !Self::refuse(cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for the backoff delay. `false` on disconnect.
    async fn wait(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.reconnect_enabled(),
                cmd = self.commands.recv() => {
                    if !Self::refuse(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Answer a command received while not connected. `false` means stop.
    fn refuse(cmd: Option<LinkCommand>) -> bool {
        match cmd {
            Some(LinkCommand::Send(_, reply)) => {
                let _ = reply.send(Err(Error::Delivery("link not connected".into())));
                true
            }
            Some(LinkCommand::Disconnect) | None => false,
        }
    }

    async fn session(&mut self, stream: LinkStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.inbox.send(Frame::parse(&text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = self.inbox.send(Frame::parse(&text));
                        }
                        Err(_) => debug!("Dropping non-text binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("closed by peer".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Send(text, reply)) => {
                        let result = sink
                            .send(Message::Text(text))
                            .await
                            .map_err(|e| Error::Delivery(e.to_string()));
                        let failed = result.as_ref().err().map(|e| e.to_string());
                        let _ = reply.send(result);
                        if let Some(reason) = failed {
                            return SessionEnd::Lost(reason);
                        }
                    }
                    Some(LinkCommand::Disconnect) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Disconnect;
                    }
                },
            }
        }
    }
}
