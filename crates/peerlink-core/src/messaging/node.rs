//! One-conversation node: transport, links, handshake and outbox together.
//!
//! ```text
//! TransportBootstrap ──ready──▶ LinkSupervisor ──Connected──▶ HandshakeCoordinator
//!                                    │                              │
//!                              InboundEvents ──classify──▶ handshake / payload
//!                                    ▲
//!                 OutboxWorker ──FROM:<sender> <payload>──┘
//! ```

use super::delivery::{LinkRouter, OutboxWorker};
use crate::config::NodeConfig;
use crate::crypto::{PayloadCipher, PlaintextCipher, SharedSecret};
use crate::error::{Error, Result};
use crate::handshake::{HandshakeCoordinator, HandshakePhase, SqliteHandshakeStore};
use crate::link::{
    ConnectionStatus, Dialer, Frame, InboundEvent, InboundEvents, InboundSource, LinkSupervisor,
    SocksDialer,
};
use crate::logging::{RedactedAddress, RedactedBytes};
use crate::storage::{Database, Outbox, OutboxStats, StoredMessage};
use crate::tor::{TransportBootstrap, TransportSnapshot, TransportStatus};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settings key holding the last published rendezvous address.
pub const LOCAL_ADDRESS_KEY: &str = "rendezvous_address";

/// Events emitted by the node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Transport status changed.
    TransportChanged {
        /// New status.
        status: TransportStatus,
        /// Bootstrap percentage.
        percent: u8,
    },
    /// Outbound link status changed.
    LinkChanged(ConnectionStatus),
    /// Key agreement with a peer finished.
    HandshakeComplete {
        /// The peer's rendezvous address.
        peer: String,
    },
    /// A payload frame arrived.
    MessageReceived {
        /// Sender rendezvous address.
        from: String,
        /// Decrypted message text.
        body: String,
        /// Receive time (Unix milliseconds).
        timestamp: i64,
    },
    /// An outbox entry was handed to a connected link.
    MessageDelivered {
        /// Outbox entry ID.
        id: i64,
        /// Recipient rendezvous address.
        to: String,
    },
    /// An inbound frame was dropped.
    FrameDiscarded {
        /// Why it was dropped.
        reason: String,
    },
}

/// A running peer node.
pub struct PeerNode {
    transport: Option<Arc<TransportBootstrap>>,
    transport_rx: watch::Receiver<TransportSnapshot>,
    supervisor: Arc<LinkSupervisor>,
    coordinator: Arc<HandshakeCoordinator>,
    database: Arc<Database>,
    outbox: Outbox,
    cipher: Arc<dyn PayloadCipher>,
    drain_period: std::time::Duration,
    drain_trigger: Mutex<Option<Arc<Notify>>>,
    event_tx: broadcast::Sender<NodeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNode {
    /// Node that runs its own transport process, storing everything under
    /// `data_dir`.
    pub fn open<P: AsRef<Path>>(config: NodeConfig, data_dir: P) -> Result<Arc<Self>> {
        let config = config.with_data_dir(data_dir.as_ref());
        let database = Database::open_path(NodeConfig::database_path(data_dir.as_ref()))?;

        let transport = TransportBootstrap::new(config.transport.clone());
        let dialer: Arc<dyn Dialer> = Arc::new(SocksDialer::new(
            transport.socks_proxy(),
            config.link.dial_timeout(),
        ));
        let transport_rx = transport.subscribe();
        let supervisor =
            LinkSupervisor::with_transport(config.link.clone(), Arc::clone(&transport), dialer);

        Self::assemble(
            config,
            Some(transport),
            transport_rx,
            supervisor,
            database,
            Arc::new(PlaintextCipher),
        )
    }

    /// Node following an externally driven transport state and dialing
    /// with `dialer`.
    pub fn with_parts(
        config: NodeConfig,
        listen_addr: SocketAddr,
        dialer: Arc<dyn Dialer>,
        transport_rx: watch::Receiver<TransportSnapshot>,
        database: Database,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<Arc<Self>> {
        let supervisor =
            LinkSupervisor::new(config.link.clone(), listen_addr, dialer, transport_rx.clone());
        Self::assemble(config, None, transport_rx, supervisor, database, cipher)
    }

    fn assemble(
        config: NodeConfig,
        transport: Option<Arc<TransportBootstrap>>,
        transport_rx: watch::Receiver<TransportSnapshot>,
        supervisor: Arc<LinkSupervisor>,
        database: Database,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<Arc<Self>> {
        let outbox = Outbox::from_connection(database.connection())?;
        let store = SqliteHandshakeStore::from_connection(database.connection())?;
        let (event_tx, _) = broadcast::channel(100);

        Ok(Arc::new(Self {
            transport,
            transport_rx,
            supervisor,
            coordinator: Arc::new(HandshakeCoordinator::new(Arc::new(store))),
            database: Arc::new(database),
            outbox,
            cipher,
            drain_period: config.outbox.drain_interval(),
            drain_trigger: Mutex::new(None),
            event_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the transport (if owned), the listener and the background
    /// tasks. Returns the listener address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if let Some(transport) = &self.transport {
            transport.start();
        }
        let bound = self.supervisor.start().await?;

        let inbound = self
            .supervisor
            .take_inbound()
            .ok_or_else(|| Error::Link("node already started".into()))?;

        let mut handles = Vec::new();

        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.classify_loop(inbound).await }));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.follow_transport().await }));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.follow_link().await }));

        let router: Arc<dyn LinkRouter> = Arc::clone(&self.supervisor) as Arc<dyn LinkRouter>;
        let worker = OutboxWorker::new(self.outbox.clone(), router, self.drain_period);
        *lock(&self.drain_trigger) = Some(worker.trigger());
        let event_tx = self.event_tx.clone();
        handles.push(worker.spawn(move |report| {
            for entry in &report.delivered {
                let _ = event_tx.send(NodeEvent::MessageDelivered {
                    id: entry.id,
                    to: entry.recipient.clone(),
                });
            }
        }));

        lock(&self.tasks).extend(handles);
        info!(%bound, "Peer node started");
        Ok(bound)
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Make `peer` the active conversation.
    pub fn open_conversation(&self, peer: &str) {
        self.supervisor.open_conversation(peer);
    }

    /// Close the active conversation.
    pub fn close_conversation(&self) {
        self.supervisor.close_conversation();
    }

    /// Tear down and redial the active conversation's link.
    pub fn force_reconnect(&self) -> Result<()> {
        self.supervisor.force_reconnect()
    }

    /// Queue `text` for `recipient` and attempt delivery right away.
    ///
    /// Returns the outbox entry ID. The message is durable once this
    /// returns, whether or not a link is up.
    pub fn send_message(&self, recipient: &str, text: &str) -> Result<i64> {
        let sender = self.local_address().ok_or(Error::NotReady)?;
        let secret = self.coordinator.shared_secret(recipient)?;
        if self.cipher.requires_secret() && secret.is_none() {
            return Err(Error::Crypto("handshake not complete".into()));
        }
        let payload = self.cipher.encrypt(text.as_bytes(), secret.as_ref())?;

        let id = self.outbox.enqueue(&sender, recipient, &payload)?;
        self.database
            .store_message(recipient, text, true, chrono::Utc::now().timestamp_millis())?;
        debug!(id, to = %RedactedAddress(recipient), size = %RedactedBytes(&payload), "Message queued");

        if let Some(trigger) = lock(&self.drain_trigger).as_ref() {
            trigger.notify_one();
        }
        Ok(id)
    }

    /// Our rendezvous address: the live one, else the last one published.
    pub fn local_address(&self) -> Option<String> {
        if let Some(address) = self.supervisor.local_address() {
            return Some(address);
        }
        self.database
            .get_setting(LOCAL_ADDRESS_KEY)
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Active conversation peer.
    pub fn peer(&self) -> Option<String> {
        self.supervisor.peer()
    }

    /// Current transport snapshot.
    pub fn transport_snapshot(&self) -> TransportSnapshot {
        self.transport_rx.borrow().clone()
    }

    /// Human-readable transport status.
    pub fn status_text(&self) -> String {
        self.transport_rx.borrow().status.describe()
    }

    /// Coarse link status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.supervisor.connection_status()
    }

    /// Handshake phase with `peer`.
    pub fn handshake_phase(&self, peer: &str) -> Result<HandshakePhase> {
        self.coordinator.phase(peer)
    }

    /// Forget the handshake with `peer` so a fresh key from it is accepted.
    pub fn reset_handshake(&self, peer: &str) -> Result<()> {
        self.coordinator.reset(peer)
    }

    /// Shared secret with `peer`, once the handshake is complete.
    pub fn shared_secret(&self, peer: &str) -> Result<Option<SharedSecret>> {
        self.coordinator.shared_secret(peer)
    }

    /// Message history with `peer`.
    pub fn history(&self, peer: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        self.database.messages_for(peer, limit)
    }

    /// Outbox statistics.
    pub fn outbox_stats(&self) -> Result<OutboxStats> {
        self.outbox.stats()
    }

    /// The node database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Stop background tasks, then shut the supervisor (and transport) down.
    pub async fn shutdown(&self) {
        for task in std::mem::take(&mut *lock(&self.tasks)) {
            task.abort();
        }
        lock(&self.drain_trigger).take();
        self.supervisor.shutdown().await;
        info!("Peer node stopped");
    }

    async fn classify_loop(self: Arc<Self>, mut inbound: InboundEvents) {
        while let Some(event) = inbound.recv().await {
            self.handle_inbound(event).await;
        }
        debug!("Inbound stream closed");
    }

    async fn handle_inbound(&self, event: InboundEvent) {
        match event.frame {
            Frame::Handshake { public_key } => {
                let peer = match event.source {
                    InboundSource::Link(address) => Some(address),
                    InboundSource::Listener(_) => self.supervisor.peer(),
                };
                match peer {
                    Some(peer) => self.handle_handshake(&peer, &public_key).await,
                    None => self.discard("handshake from unknown peer"),
                }
            }
            Frame::Payload { sender, body } => {
                if let Err(e) = self.handle_payload(&sender, &body) {
                    warn!(from = %RedactedAddress(&sender), error = %e, "Dropping payload");
                    self.discard(&e.to_string());
                }
            }
            Frame::Unknown(text) => {
                debug!(size = text.len(), "Unrecognized frame");
                self.discard("unrecognized frame");
            }
        }
    }

    async fn handle_handshake(&self, peer: &str, public_key: &str) {
        let outcome = match self.coordinator.on_handshake_frame(peer, public_key) {
            Ok(outcome) => outcome,
            Err(e) if e.should_drop_frame() => {
                warn!(peer = %RedactedAddress(peer), error = %e, "Dropping handshake frame");
                self.discard(&e.to_string());
                return;
            }
            Err(e) => {
                error!(peer = %RedactedAddress(peer), error = %e, "Handshake failed");
                return;
            }
        };

        if outcome.reply.is_some() {
            self.flush_pending_reply(peer).await;
        }
        if outcome.newly_complete {
            let _ = self.event_tx.send(NodeEvent::HandshakeComplete {
                peer: peer.to_string(),
            });
        }
    }

    // Hands a reply owed to `peer` to its link; it stays pending on failure.
    async fn flush_pending_reply(&self, peer: &str) {
        let reply = match self.coordinator.pending_reply(peer) {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                error!(peer = %RedactedAddress(peer), error = %e, "Pending reply lookup failed");
                return;
            }
        };
        match self.supervisor.send_to(peer, &reply).await {
            Ok(()) => {
                if let Err(e) = self.coordinator.reply_sent(peer) {
                    warn!(peer = %RedactedAddress(peer), error = %e, "Failed to clear pending reply");
                }
                debug!(peer = %RedactedAddress(peer), "Handshake reply sent");
            }
            Err(e) => {
                debug!(peer = %RedactedAddress(peer), error = %e, "Handshake reply pending until link is up");
            }
        }
    }

    fn handle_payload(&self, sender: &str, body: &str) -> Result<()> {
        let secret = self.coordinator.shared_secret(sender)?;
        let plain = self.cipher.decrypt(body.as_bytes(), secret.as_ref())?;
        let text = String::from_utf8(plain).map_err(|e| Error::Encoding(e.to_string()))?;
        let timestamp = chrono::Utc::now().timestamp_millis();

        self.database.store_message(sender, &text, false, timestamp)?;
        debug!(from = %RedactedAddress(sender), "Message received");
        let _ = self.event_tx.send(NodeEvent::MessageReceived {
            from: sender.to_string(),
            body: text,
            timestamp,
        });
        Ok(())
    }

    fn discard(&self, reason: &str) {
        let _ = self.event_tx.send(NodeEvent::FrameDiscarded {
            reason: reason.to_string(),
        });
    }

    async fn follow_transport(self: Arc<Self>) {
        let mut rx = self.transport_rx.clone();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if let Some(address) = &snapshot.rendezvous_address {
                if let Err(e) = self.database.set_setting(LOCAL_ADDRESS_KEY, address.as_bytes()) {
                    warn!(error = %e, "Failed to remember rendezvous address");
                }
            }
            let _ = self.event_tx.send(NodeEvent::TransportChanged {
                status: snapshot.status,
                percent: snapshot.bootstrap_percent,
            });
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn follow_link(self: Arc<Self>) {
        let mut rx = self.supervisor.subscribe_status();
        while rx.changed().await.is_ok() {
            let status = *rx.borrow_and_update();
            let _ = self.event_tx.send(NodeEvent::LinkChanged(status));
            if status == ConnectionStatus::Connected {
                self.on_link_connected().await;
            }
        }
    }

    async fn on_link_connected(&self) {
        let (Some(local), Some(peer)) = (self.supervisor.local_address(), self.supervisor.peer())
        else {
            return;
        };
        match self.coordinator.on_connected(&local, &peer) {
            Ok(Some(frame)) => {
                if let Err(e) = self.supervisor.send_to(&peer, &frame).await {
                    warn!(peer = %RedactedAddress(&peer), error = %e, "Handshake frame not sent");
                }
            }
            Ok(None) => {}
            Err(e) => error!(peer = %RedactedAddress(&peer), error = %e, "Handshake start failed"),
        }
        self.flush_pending_reply(&peer).await;
        if let Some(trigger) = lock(&self.drain_trigger).as_ref() {
            trigger.notify_one();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
