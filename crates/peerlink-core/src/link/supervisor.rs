//! Inbound listener plus the one outbound link of the active conversation.
//!
//! Frames from both directions converge on a single [`InboundEvents`]
//! stream. The outbound [`PeerLink`] is provisioned when the transport
//! becomes ready and re-provisioned by a periodic health check whenever it
//! is absent or disconnected.

use super::dialer::Dialer;
use super::frame::Frame;
use super::peer_link::{LinkState, PeerLink};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::logging::RedactedAddress;
use crate::tor::{TransportBootstrap, TransportSnapshot};
use futures_util::{Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Where an inbound frame arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSource {
    /// The outbound link to this address.
    Link(String),
    /// An accepted listener connection.
    Listener(u64),
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Where it came from.
    pub source: InboundSource,
    /// The frame.
    pub frame: Frame,
}

/// Coarse projection of the monitored link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Link provisioned, not yet connected.
    Initialized,
    /// Link connected.
    Connected,
    /// Link lost and waiting to reconnect, or shut down.
    Disconnected,
    /// No outbound link.
    NoClient,
    /// Link gave up.
    Failed,
}

impl From<LinkState> for ConnectionStatus {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Idle | LinkState::Connecting => ConnectionStatus::Initialized,
            LinkState::Connected => ConnectionStatus::Connected,
            LinkState::Disconnected => ConnectionStatus::Disconnected,
            LinkState::Failed => ConnectionStatus::Failed,
        }
    }
}

/// Merged inbound frames from the listener and the outbound link.
pub struct InboundEvents {
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

impl InboundEvents {
    /// Next event.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }
}

impl Stream for InboundEvents {
    type Item = InboundEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<InboundEvent>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    transport_watch: Option<JoinHandle<()>>,
    health_check: Option<JoinHandle<()>>,
    inbound: Vec<JoinHandle<()>>,
}

/// Owns the inbound listener and the outbound link.
pub struct LinkSupervisor {
    config: LinkConfig,
    listen_addr: SocketAddr,
    dialer: Arc<dyn Dialer>,
    transport_rx: watch::Receiver<TransportSnapshot>,
    transport: Option<Arc<TransportBootstrap>>,
    peer: RwLock<Option<String>>,
    link: RwLock<Option<Arc<PeerLink>>>,
    generation: Arc<AtomicU64>,
    next_inbound_id: AtomicU64,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    tasks: Mutex<Tasks>,
}

impl LinkSupervisor {
    /// Supervisor following an externally owned transport state.
    pub fn new(
        config: LinkConfig,
        listen_addr: SocketAddr,
        dialer: Arc<dyn Dialer>,
        transport_rx: watch::Receiver<TransportSnapshot>,
    ) -> Arc<Self> {
        Arc::new(Self::build(config, listen_addr, dialer, transport_rx, None))
    }

    /// Supervisor that also stops `transport` on shutdown.
    pub fn with_transport(
        config: LinkConfig,
        transport: Arc<TransportBootstrap>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        let listen_addr = transport.config().listen_addr();
        let rx = transport.subscribe();
        Arc::new(Self::build(config, listen_addr, dialer, rx, Some(transport)))
    }

    fn build(
        config: LinkConfig,
        listen_addr: SocketAddr,
        dialer: Arc<dyn Dialer>,
        transport_rx: watch::Receiver<TransportSnapshot>,
        transport: Option<Arc<TransportBootstrap>>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NoClient);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            listen_addr,
            dialer,
            transport_rx,
            transport,
            peer: RwLock::new(None),
            link: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            next_inbound_id: AtomicU64::new(1),
            status: Arc::new(status),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Bind the listener and start following the transport.
    ///
    /// Returns the bound listener address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| Error::Link(format!("failed to bind {}: {}", self.listen_addr, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Link(e.to_string()))?;

        info!(%bound, "Inbound listener started");

        let this = Arc::clone(self);
        let accept = tokio::spawn(async move { this.accept_loop(listener).await });

        let this = Arc::clone(self);
        let transport_watch = tokio::spawn(async move { this.follow_transport().await });

        let this = Arc::clone(self);
        let health_check = tokio::spawn(async move { this.health_check().await });

        let mut tasks = self.lock_tasks();
        tasks.listener = Some(accept);
        tasks.transport_watch = Some(transport_watch);
        tasks.health_check = Some(health_check);

        Ok(bound)
    }

    /// Take the merged inbound stream. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<InboundEvents> {
        let rx = match self.events_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        rx.map(|rx| InboundEvents { rx })
    }

    /// Make `peer` the active conversation and dial it if the transport is
    /// ready.
    pub fn open_conversation(&self, peer: impl Into<String>) {
        let peer = peer.into();
        info!(peer = %RedactedAddress(&peer), "Opening conversation");

        let previous = {
            let mut guard = write(&self.peer);
            guard.replace(peer.clone())
        };
        if previous.as_deref() != Some(peer.as_str()) {
            self.drop_link();
        }
        if self.transport_ready() && self.needs_link() {
            self.provision("conversation opened");
        }
    }

    /// Close the active conversation and its link.
    pub fn close_conversation(&self) {
        write(&self.peer).take();
        self.drop_link();
    }

    /// Address of the active conversation.
    pub fn peer(&self) -> Option<String> {
        read(&self.peer).clone()
    }

    /// Current outbound link.
    pub fn link(&self) -> Option<Arc<PeerLink>> {
        read(&self.link).clone()
    }

    /// Outbound link if it dials `address`.
    pub fn link_for(&self, address: &str) -> Option<Arc<PeerLink>> {
        self.link().filter(|link| link.address() == address)
    }

    /// Send a frame over the link to `address`.
    pub async fn send_to(&self, address: &str, frame: &Frame) -> Result<()> {
        let link = self
            .link_for(address)
            .ok_or_else(|| Error::Delivery("no link to recipient".into()))?;
        link.send(frame).await
    }

    /// Tear down and recreate the outbound link now.
    pub fn force_reconnect(&self) -> Result<()> {
        if !self.transport_ready() {
            return Err(Error::NotReady);
        }
        if self.peer().is_none() {
            return Err(Error::NotFound("no active conversation".into()));
        }
        self.drop_link();
        self.provision("forced reconnect");
        Ok(())
    }

    /// Coarse link status.
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Observe link status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Whether the transport is ready.
    pub fn transport_ready(&self) -> bool {
        self.transport_rx.borrow().is_ready()
    }

    /// Rendezvous address published by the transport.
    pub fn local_address(&self) -> Option<String> {
        self.transport_rx.borrow().rendezvous_address.clone()
    }

    /// Stop health checks, drop the link, stop the listener, then stop the
    /// transport.
    pub async fn shutdown(&self) {
        info!("Shutting down link supervisor");

        let tasks = std::mem::take(&mut *self.lock_tasks());

        if let Some(task) = tasks.transport_watch {
            task.abort();
        }
        if let Some(task) = tasks.health_check {
            task.abort();
        }

        self.drop_link();

        if let Some(task) = tasks.listener {
            task.abort();
        }
        for task in tasks.inbound {
            task.abort();
        }

        if let Some(transport) = &self.transport {
            transport.stop().await;
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn needs_link(&self) -> bool {
        if self.peer().is_none() {
            return false;
        }
        match self.link() {
            None => true,
            Some(link) => matches!(link.state(), LinkState::Disconnected | LinkState::Failed),
        }
    }

    fn drop_link(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = write(&self.link).take() {
            link.disconnect();
        }
        self.status.send_replace(ConnectionStatus::NoClient);
    }

    /// Replace the outbound link with a fresh one to the active peer.
    fn provision(&self, reason: &str) {
        let Some(peer) = self.peer() else {
            return;
        };

        debug!(peer = %RedactedAddress(&peer), reason, "Provisioning link");

        let link = Arc::new(PeerLink::new(
            peer.clone(),
            Arc::clone(&self.dialer),
            self.config.backoff(),
        ));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(mut inbound) = link.take_inbound() {
            let events = self.events_tx.clone();
            let source = InboundSource::Link(peer);
            tokio::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    let event = InboundEvent {
                        source: source.clone(),
                        frame,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            });
        }

        self.status.send_replace(ConnectionStatus::Initialized);
        let mut state_rx = link.subscribe_state();
        let status = Arc::clone(&self.status);
        let current = Arc::clone(&self.generation);
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                if current.load(Ordering::SeqCst) != generation {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                status.send_replace(ConnectionStatus::from(state));
            }
        });

        let old = write(&self.link).replace(Arc::clone(&link));
        if let Some(old) = old {
            old.disconnect();
        }
        link.connect();
    }

    async fn follow_transport(self: Arc<Self>) {
        let mut rx = self.transport_rx.clone();
        loop {
            let ready = rx.borrow_and_update().is_ready();
            if ready && self.needs_link() {
                self.provision("transport ready");
            } else if !ready && self.link().is_some() {
                debug!("Transport not ready, dropping link");
                self.drop_link();
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn health_check(self: Arc<Self>) {
        let period = self
            .config
            .health_check_interval()
            .max(std::time::Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.transport_ready() && self.needs_link() {
                self.provision("health check");
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((tcp, remote)) => {
                    let id = self.next_inbound_id.fetch_add(1, Ordering::SeqCst);
                    debug!(id, %remote, "Accepted inbound connection");
                    let events = self.events_tx.clone();
                    let handle = tokio::spawn(serve_inbound(id, tcp, events));

                    let mut tasks = self.lock_tasks();
                    tasks.inbound.retain(|task| !task.is_finished());
                    tasks.inbound.push(handle);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_inbound(id: u64, tcp: TcpStream, events: mpsc::UnboundedSender<InboundEvent>) {
    let mut ws = match tokio_tungstenite::accept_async(tcp).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(id, error = %e, "Inbound handshake failed");
            return;
        }
    };

    while let Some(msg) = ws.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(id, error = %e, "Inbound stream error");
                break;
            }
        };

        let event = InboundEvent {
            source: InboundSource::Listener(id),
            frame: Frame::parse(&text),
        };
        if events.send(event).is_err() {
            break;
        }
    }

    debug!(id, "Inbound connection closed");
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DirectDialer;
    use futures_util::SinkExt;
    use std::time::Duration;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            backoff_step_ms: 20,
            backoff_cap_ms: 100,
            health_check_ms: 50,
            dial_timeout_secs: 5,
        }
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn next_event(events: &mut InboundEvents) -> InboundEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_force_reconnect_requires_ready_transport() {
        let (_tx, rx) = watch::channel(TransportSnapshot::stopped());
        let supervisor = LinkSupervisor::new(fast_config(), loopback(), Arc::new(DirectDialer::new()), rx);
        supervisor.open_conversation("b.onion");
        assert!(matches!(supervisor.force_reconnect(), Err(Error::NotReady)));
        assert_eq!(supervisor.connection_status(), ConnectionStatus::NoClient);
    }

    #[tokio::test]
    async fn test_listener_frames_are_classified() {
        let (_tx, rx) = watch::channel(TransportSnapshot::ready("a.onion"));
        let supervisor = LinkSupervisor::new(fast_config(), loopback(), Arc::new(DirectDialer::new()), rx);
        let bound = supervisor.start().await.unwrap();
        let mut events = supervisor.take_inbound().unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/chat", bound))
            .await
            .unwrap();
        ws.send(Message::Text("FROM:b.onion hi".into())).await.unwrap();
        ws.send(Message::Text("garbage".into())).await.unwrap();

        let first = next_event(&mut events).await;
        assert!(matches!(first.source, InboundSource::Listener(_)));
        assert_eq!(first.frame, Frame::payload("b.onion", "hi"));

        let second = next_event(&mut events).await;
        assert_eq!(second.frame, Frame::Unknown("garbage".into()));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_provision_on_ready_and_merge_link_frames() {
        let remote = TcpListener::bind(loopback()).await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = remote.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text("ECDH_PUBLIC_KEY:QUJD".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let dialer = DirectDialer::new();
        dialer.route("b.onion", remote_addr);

        let (tx, rx) = watch::channel(TransportSnapshot::stopped());
        let supervisor = LinkSupervisor::new(fast_config(), loopback(), Arc::new(dialer), rx);
        supervisor.start().await.unwrap();
        let mut events = supervisor.take_inbound().unwrap();

        supervisor.open_conversation("b.onion");
        assert!(supervisor.link().is_none());

        tx.send_replace(TransportSnapshot::ready("a.onion"));
        let mut status = supervisor.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(supervisor.local_address().as_deref(), Some("a.onion"));
        assert!(supervisor.link_for("b.onion").is_some());
        assert!(supervisor.link_for("c.onion").is_none());

        let event = next_event(&mut events).await;
        assert_eq!(event.source, InboundSource::Link("b.onion".into()));
        assert_eq!(event.frame, Frame::handshake("QUJD"));

        supervisor.shutdown().await;
        assert_eq!(supervisor.connection_status(), ConnectionStatus::NoClient);
        assert!(supervisor.link().is_none());
    }

    #[tokio::test]
    async fn test_send_without_link_is_delivery_error() {
        let (_tx, rx) = watch::channel(TransportSnapshot::ready("a.onion"));
        let supervisor = LinkSupervisor::new(fast_config(), loopback(), Arc::new(DirectDialer::new()), rx);
        let err = supervisor
            .send_to("b.onion", &Frame::payload("a.onion", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }
}
