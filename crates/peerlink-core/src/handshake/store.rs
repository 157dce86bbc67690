//! Persisted per-peer handshake state.

use crate::crypto::{StaticKeypair, X25519PublicKey, X25519_KEY_SIZE};
use crate::error::{Error, Result};
use crate::storage::CREATE_HANDSHAKE_STATE;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Progress of the key exchange with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakePhase {
    /// No key has been sent or received.
    NotStarted,
    /// Our public key went out; waiting for theirs.
    Sent,
    /// Both keys known and the secret derived.
    Complete,
}

/// What gets written for a peer once its handshake has begun.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredHandshake {
    /// Local X25519 secret.
    pub local_secret: [u8; X25519_KEY_SIZE],
    /// Peer's public key, once received.
    pub remote_public: Option<[u8; X25519_KEY_SIZE]>,
    /// Derived secret, once complete.
    pub shared_secret: Option<[u8; X25519_KEY_SIZE]>,
    /// Current phase.
    #[zeroize(skip)]
    pub phase: HandshakePhase,
}

impl StoredHandshake {
    /// Fresh state for a newly generated keypair that has just been sent.
    pub fn sent(keypair: &StaticKeypair) -> Self {
        Self {
            local_secret: keypair.secret_bytes(),
            remote_public: None,
            shared_secret: None,
            phase: HandshakePhase::Sent,
        }
    }

    /// Restore the local keypair.
    pub fn keypair(&self) -> StaticKeypair {
        StaticKeypair::from_secret_bytes(self.local_secret)
    }

    /// Check internal consistency.
    ///
    /// A complete entry must carry both the remote key and a secret that
    /// re-derives from the stored keys.
    pub fn validate(&self) -> Result<()> {
        match (self.phase, &self.remote_public, &self.shared_secret) {
            (HandshakePhase::Sent, None, None) => Ok(()),
            (HandshakePhase::Complete, Some(remote), Some(secret)) => {
                let derived = self
                    .keypair()
                    .agree(&X25519PublicKey::from_bytes(*remote))
                    .map_err(|e| Error::PersistenceDecode(e.to_string()))?;
                if derived.as_bytes() == secret {
                    Ok(())
                } else {
                    Err(Error::PersistenceDecode("secret mismatch".into()))
                }
            }
            (phase, _, _) => Err(Error::PersistenceDecode(format!(
                "inconsistent fields for phase {:?}",
                phase
            ))),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Encoding(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::PersistenceDecode(e.to_string()))
    }
}

impl fmt::Debug for StoredHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredHandshake")
            .field("phase", &self.phase)
            .field("remote_public", &self.remote_public.is_some())
            .field("local_secret", &"[REDACTED]")
            .field("shared_secret", &"[REDACTED]")
            .finish()
    }
}

/// Keyed storage for handshake state.
pub trait HandshakeStore: Send + Sync {
    /// Insert or replace the state for `peer`.
    fn put(&self, peer: &str, state: &StoredHandshake) -> Result<()>;

    /// State for `peer`, or `Err(PersistenceDecode)` if the stored bytes
    /// are unreadable.
    fn get(&self, peer: &str) -> Result<Option<StoredHandshake>>;

    /// Forget `peer`.
    fn delete(&self, peer: &str) -> Result<()>;
}

/// Handshake state in the `handshake_state` table.
#[derive(Clone)]
pub struct SqliteHandshakeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHandshakeStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// In-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Use an already open connection.
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = Self { conn };
        store.lock()?.execute_batch(CREATE_HANDSHAKE_STATE)?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }

    /// Write raw bytes for `peer`. Used to simulate corruption in tests.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, peer: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO handshake_state (peer, state, updated_at) VALUES (?, ?, 0)",
            params![peer, bytes],
        )?;
        Ok(())
    }
}

impl HandshakeStore for SqliteHandshakeStore {
    fn put(&self, peer: &str, state: &StoredHandshake) -> Result<()> {
        let bytes = state.encode()?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO handshake_state (peer, state, updated_at) VALUES (?, ?, ?)",
            params![peer, bytes, now],
        )?;
        Ok(())
    }

    fn get(&self, peer: &str) -> Result<Option<StoredHandshake>> {
        let conn = self.lock()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM handshake_state WHERE peer = ?",
                params![peer],
                |row| row.get(0),
            )
            .optional()?;
        bytes.map(|b| StoredHandshake::decode(&b)).transpose()
    }

    fn delete(&self, peer: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM handshake_state WHERE peer = ?", params![peer])?;
        Ok(())
    }
}

/// Process-local store. Entries are kept encoded so `get` goes through the
/// same decode path as the SQLite store.
#[derive(Default)]
pub struct MemoryHandshakeStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryHandshakeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }
}

impl HandshakeStore for MemoryHandshakeStore {
    fn put(&self, peer: &str, state: &StoredHandshake) -> Result<()> {
        let bytes = state.encode()?;
        self.lock()?.insert(peer.to_string(), bytes);
        Ok(())
    }

    fn get(&self, peer: &str) -> Result<Option<StoredHandshake>> {
        let entries = self.lock()?;
        entries
            .get(peer)
            .map(|b| StoredHandshake::decode(b))
            .transpose()
    }

    fn delete(&self, peer: &str) -> Result<()> {
        self.lock()?.remove(peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_state() -> StoredHandshake {
        let local = StaticKeypair::generate();
        let remote = StaticKeypair::generate();
        let secret = local.agree(remote.public_key()).unwrap();
        StoredHandshake {
            local_secret: local.secret_bytes(),
            remote_public: Some(*remote.public_key().as_bytes()),
            shared_secret: Some(*secret.as_bytes()),
            phase: HandshakePhase::Complete,
        }
    }

    #[test]
    fn test_validate() {
        assert!(complete_state().validate().is_ok());
        assert!(StoredHandshake::sent(&StaticKeypair::generate())
            .validate()
            .is_ok());

        let mut tampered = complete_state();
        tampered.shared_secret = Some([7u8; X25519_KEY_SIZE]);
        assert!(matches!(tampered.validate(), Err(Error::PersistenceDecode(_))));

        let mut partial = complete_state();
        partial.remote_public = None;
        assert!(partial.validate().is_err());
    }

    #[test]
    fn test_sqlite_store() {
        let store = SqliteHandshakeStore::open_in_memory().unwrap();
        assert!(store.get("b.onion").unwrap().is_none());

        let state = complete_state();
        store.put("b.onion", &state).unwrap();
        let loaded = store.get("b.onion").unwrap().unwrap();
        assert_eq!(loaded.phase, HandshakePhase::Complete);
        assert_eq!(loaded.shared_secret, state.shared_secret);

        store.delete("b.onion").unwrap();
        assert!(store.get("b.onion").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_store_corrupt_bytes() {
        let store = SqliteHandshakeStore::open_in_memory().unwrap();
        store.put_raw("b.onion", b"garbage").unwrap();
        assert!(matches!(
            store.get("b.onion"),
            Err(Error::PersistenceDecode(_))
        ));
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hs.db");
        let state = complete_state();
        {
            let store = SqliteHandshakeStore::open(&path).unwrap();
            store.put("b.onion", &state).unwrap();
        }
        let store = SqliteHandshakeStore::open(&path).unwrap();
        let loaded = store.get("b.onion").unwrap().unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.local_secret, state.local_secret);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let state = complete_state();
        let debug = format!("{:?}", state);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&format!("{:?}", state.local_secret)));
    }
}
