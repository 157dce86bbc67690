//! Contacts, message history and settings.

use super::schema::{CREATE_HANDSHAKE_STATE, CREATE_OUTBOX, CREATE_SCHEMA, SCHEMA_VERSION};
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: String,
    /// Whether to use in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: super::DEFAULT_DB_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    /// Contact ID.
    pub id: i64,
    /// Rendezvous address.
    pub address: String,
    /// Optional display name.
    pub display_name: Option<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl Contact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            address: row.get(1)?,
            display_name: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    /// Display name, falling back to the address.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}

/// One message in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    /// Message ID.
    pub id: i64,
    /// Peer the message was exchanged with.
    pub peer_address: String,
    /// Message text.
    pub body: String,
    /// Whether this is an outgoing message.
    pub outgoing: bool,
    /// Timestamp (Unix milliseconds).
    pub timestamp: i64,
}

/// Database handle.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            // Create parent directories if needed
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Storage(format!("failed to create directory: {}", e)))?;
                }
            }

            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = DELETE;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open the database file at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: path.as_ref().to_string_lossy().into_owned(),
            in_memory: false,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: String::new(),
            in_memory: true,
        })
    }

    /// Shared connection for the other stores in this file.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        for batch in [CREATE_SCHEMA, CREATE_OUTBOX, CREATE_HANDSHAKE_STATE] {
            conn.execute_batch(batch)
                .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?)",
            params![SCHEMA_VERSION.to_string().as_bytes()],
        )?;
        Ok(())
    }

    /// Add a contact.
    pub fn add_contact(&self, address: &str, display_name: Option<&str>) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO contacts (address, display_name, created_at) VALUES (?, ?, ?)",
            params![address, display_name, now],
        )
        .map_err(|e| Error::Storage(format!("failed to add contact: {}", e)))?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a contact by ID.
    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        let contact = conn
            .query_row(
                "SELECT id, address, display_name, created_at FROM contacts WHERE id = ?",
                params![id],
                Contact::from_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// Get a contact by rendezvous address.
    pub fn get_contact_by_address(&self, address: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        let contact = conn
            .query_row(
                "SELECT id, address, display_name, created_at FROM contacts WHERE address = ?",
                params![address],
                Contact::from_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// List all contacts.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, address, display_name, created_at FROM contacts ORDER BY display_name, address",
        )?;
        let contacts = stmt
            .query_map([], Contact::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contacts)
    }

    /// Delete a contact. Returns whether it existed.
    pub fn remove_contact(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let count = conn.execute("DELETE FROM contacts WHERE id = ?", params![id])?;
        Ok(count > 0)
    }

    /// Append a message to the history.
    pub fn store_message(
        &self,
        peer_address: &str,
        body: &str,
        outgoing: bool,
        timestamp: i64,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (peer_address, body, outgoing, timestamp) VALUES (?, ?, ?, ?)",
            params![peer_address, body, outgoing as i32, timestamp],
        )
        .map_err(|e| Error::Storage(format!("failed to store message: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent `limit` messages with a peer, in chronological order.
    pub fn messages_for(&self, peer_address: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, peer_address, body, outgoing, timestamp
            FROM messages
            WHERE peer_address = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )?;

        let mut messages = stmt
            .query_map(params![peer_address, limit], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    peer_address: row.get(1)?,
                    body: row.get(2)?,
                    outgoing: row.get::<_, i32>(3)? != 0,
                    timestamp: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    /// Delete messages older than `cutoff` (Unix milliseconds).
    pub fn delete_messages_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute("DELETE FROM messages WHERE timestamp < ?", params![cutoff])?;
        Ok(count)
    }

    /// Store a setting.
    pub fn set_setting(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Get a setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}
