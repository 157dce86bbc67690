//! Two-message key agreement with deterministic initiator selection.
//!
//! ```text
//! lower address                         higher address
//!   on_connected ── ECDH_PUBLIC_KEY:pk_a ──▶ on_handshake_frame
//!   (NotStarted → Sent)                      (NotStarted → Complete)
//!   on_handshake_frame ◀── ECDH_PUBLIC_KEY:pk_b ──
//!   (Sent → Complete)
//! ```
//!
//! Addresses compare byte-wise. Frames go over the live link; a frame lost
//! in transit is not resent. A reply that could not be handed to a link at
//! all stays pending until [`HandshakeCoordinator::reply_sent`] is called,
//! so it can go out once the link to that peer comes up.
//!
//! Once complete, a peer's key is fixed. A different key is refused with
//! `HandshakeConflict` until [`HandshakeCoordinator::reset`] is called.

use super::store::{HandshakePhase, HandshakeStore, StoredHandshake};
use crate::crypto::{SharedSecret, StaticKeypair, X25519PublicKey};
use crate::error::{Error, Result};
use crate::link::Frame;
use crate::logging::RedactedAddress;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Result of processing an inbound handshake frame.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Frame to send back, if we had not sent our key yet.
    pub reply: Option<Frame>,
    /// The secret now held for the peer.
    pub secret: SharedSecret,
    /// Whether this frame moved the peer to `Complete`.
    pub newly_complete: bool,
}

/// Runs the handshake state machine for every peer.
pub struct HandshakeCoordinator {
    store: Arc<dyn HandshakeStore>,
    // Serializes read-modify-write cycles on the store.
    guard: Mutex<()>,
    pending_replies: Mutex<HashMap<String, Frame>>,
}

impl HandshakeCoordinator {
    /// Coordinator persisting through `store`.
    pub fn new(store: Arc<dyn HandshakeStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
            pending_replies: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `local` sends first to `peer`.
    pub fn is_initiator(local: &str, peer: &str) -> bool {
        local.as_bytes() < peer.as_bytes()
    }

    /// Called when a link to `peer` comes up.
    ///
    /// Returns the frame to send when this side initiates and nothing has
    /// been sent yet.
    pub fn on_connected(&self, local: &str, peer: &str) -> Result<Option<Frame>> {
        if !Self::is_initiator(local, peer) {
            debug!(peer = %RedactedAddress(peer), "Waiting for peer to initiate handshake");
            return Ok(None);
        }

        let _guard = self.lock()?;
        if self.load(peer)?.is_some() {
            // TODO: route handshake frames through the outbox so a key sent
            // into a dying link is retried instead of leaving this peer in
            // `Sent` until its own key arrives.
            return Ok(None);
        }

        let keypair = StaticKeypair::generate();
        self.store.put(peer, &StoredHandshake::sent(&keypair))?;
        info!(peer = %RedactedAddress(peer), "Initiating handshake");
        Ok(Some(Frame::handshake(keypair.public_key().to_base64())))
    }

    /// Process a handshake frame carrying `public_key` from `peer`.
    ///
    /// Malformed keys return `HandshakeDecode` and a key differing from a
    /// completed exchange returns `HandshakeConflict`; both leave state
    /// untouched. A reply in the outcome is also recorded as pending.
    pub fn on_handshake_frame(
        &self,
        peer: &str,
        public_key: &str,
    ) -> Result<HandshakeOutcome> {
        let remote = X25519PublicKey::from_base64(public_key)?;

        let _guard = self.lock()?;
        let prior = self.load(peer)?;
        let prior_phase = prior
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(HandshakePhase::NotStarted);

        let keypair = match &prior {
            Some(state) => state.keypair(),
            None => StaticKeypair::generate(),
        };
        let secret = keypair.agree(&remote)?;

        if let Some(known) = prior.as_ref().and_then(|s| s.remote_public) {
            if prior_phase == HandshakePhase::Complete && &known != remote.as_bytes() {
                warn!(peer = %RedactedAddress(peer), "Refusing changed key for completed handshake");
                return Err(Error::HandshakeConflict(
                    "peer key differs from completed handshake".into(),
                ));
            }
        }

        let reply = if prior_phase == HandshakePhase::NotStarted {
            Some(Frame::handshake(keypair.public_key().to_base64()))
        } else {
            None
        };

        if prior_phase != HandshakePhase::Complete {
            let state = StoredHandshake {
                local_secret: keypair.secret_bytes(),
                remote_public: Some(*remote.as_bytes()),
                shared_secret: Some(*secret.as_bytes()),
                phase: HandshakePhase::Complete,
            };
            self.store.put(peer, &state)?;
            if let Some(frame) = &reply {
                self.pending()?.insert(peer.to_string(), frame.clone());
            }
            info!(
                peer = %RedactedAddress(peer),
                responded = reply.is_some(),
                "Handshake complete"
            );
        } else {
            debug!(peer = %RedactedAddress(peer), "Duplicate handshake frame");
        }

        Ok(HandshakeOutcome {
            reply,
            secret,
            newly_complete: prior_phase != HandshakePhase::Complete,
        })
    }

    /// Shared secret for `peer`, once complete.
    pub fn shared_secret(&self, peer: &str) -> Result<Option<SharedSecret>> {
        let _guard = self.lock()?;
        Ok(self
            .load(peer)?
            .and_then(|s| s.shared_secret)
            .map(SharedSecret::from_bytes))
    }

    /// Current phase for `peer`.
    pub fn phase(&self, peer: &str) -> Result<HandshakePhase> {
        let _guard = self.lock()?;
        Ok(self
            .load(peer)?
            .map(|s| s.phase)
            .unwrap_or(HandshakePhase::NotStarted))
    }

    /// Reply owed to `peer` that has not reached a link yet.
    pub fn pending_reply(&self, peer: &str) -> Result<Option<Frame>> {
        Ok(self.pending()?.get(peer).cloned())
    }

    /// Record that the pending reply to `peer` was handed to a link.
    pub fn reply_sent(&self, peer: &str) -> Result<()> {
        self.pending()?.remove(peer);
        Ok(())
    }

    /// Forget everything about `peer`.
    pub fn reset(&self, peer: &str) -> Result<()> {
        let _guard = self.lock()?;
        self.pending()?.remove(peer);
        self.store.delete(peer)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.guard
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<String, Frame>>> {
        self.pending_replies
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }

    // Unreadable or inconsistent entries are dropped and read as absent.
    fn load(&self, peer: &str) -> Result<Option<StoredHandshake>> {
        let state = match self.store.get(peer) {
            Ok(state) => state,
            Err(Error::PersistenceDecode(reason)) => {
                warn!(peer = %RedactedAddress(peer), %reason, "Discarding unreadable handshake state");
                self.store.delete(peer)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match state {
            Some(state) => match state.validate() {
                Ok(()) => Ok(Some(state)),
                Err(e) => {
                    warn!(peer = %RedactedAddress(peer), error = %e, "Discarding inconsistent handshake state");
                    self.store.delete(peer)?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}
