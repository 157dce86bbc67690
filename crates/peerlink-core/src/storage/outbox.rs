//! Durable at-least-once outbound queue.
//!
//! Entries are written before any delivery attempt and only ever move from
//! pending to sent. Nothing here deletes rows; retention is left to the
//! caller.

use super::schema::CREATE_OUTBOX;
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Row ID, increasing in enqueue order.
    pub id: i64,
    /// Sender rendezvous address.
    pub sender: String,
    /// Recipient rendezvous address.
    pub recipient: String,
    /// Payload bytes as they go on the wire.
    pub payload: Vec<u8>,
    /// Whether the entry has been handed to a connected link.
    pub sent: bool,
    /// Enqueue time (Unix milliseconds).
    pub enqueued_at: i64,
}

impl OutboxEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender: row.get(1)?,
            recipient: row.get(2)?,
            payload: row.get(3)?,
            sent: row.get::<_, i64>(4)? != 0,
            enqueued_at: row.get(5)?,
        })
    }

    /// Payload as frame text.
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Statistics about the outbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    /// Total entries.
    pub total: usize,
    /// Entries not yet sent.
    pub pending: usize,
    /// Entries sent.
    pub sent: usize,
    /// Distinct recipients with pending entries.
    pub pending_recipients: usize,
}

const SELECT_COLUMNS: &str = "SELECT id, sender, recipient, payload, sent, enqueued_at FROM outbox";

/// The outbound queue.
#[derive(Clone)]
pub struct Outbox {
    conn: Arc<Mutex<Connection>>,
}

impl Outbox {
    /// Open or create an outbox database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// Open an in-memory outbox (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Use an already open connection.
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let outbox = Self { conn };
        outbox.lock()?.execute_batch(CREATE_OUTBOX)?;
        Ok(outbox)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }

    /// Durably append a pending entry and return its id.
    pub fn enqueue(&self, sender: &str, recipient: &str, payload: &[u8]) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO outbox (sender, recipient, payload, sent, enqueued_at) VALUES (?, ?, ?, 0, ?)",
            params![sender, recipient, payload, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All pending entries, oldest first.
    pub fn drain_pending(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} WHERE sent = 0 ORDER BY id ASC", SELECT_COLUMNS))?;
        let entries = stmt
            .query_map([], OutboxEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Pending entries for one recipient, oldest first.
    pub fn pending_for(&self, recipient: &str) -> Result<Vec<OutboxEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE sent = 0 AND recipient = ? ORDER BY id ASC",
            SELECT_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![recipient], OutboxEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Mark an entry sent. Idempotent.
    pub fn mark_delivered(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row("SELECT sent FROM outbox WHERE id = ?", params![id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("outbox entry {}", id)));
        }
        conn.execute("UPDATE outbox SET sent = 1 WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Get a single entry by ID.
    pub fn get(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_COLUMNS),
                params![id],
                OutboxEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Get outbox statistics.
    pub fn stats(&self) -> Result<OutboxStats> {
        let conn = self.lock()?;
        let (total, pending, recipients): (i64, i64, i64) = conn.query_row(
            r#"SELECT COUNT(*),
                      COALESCE(SUM(CASE WHEN sent = 0 THEN 1 ELSE 0 END), 0),
                      COUNT(DISTINCT CASE WHEN sent = 0 THEN recipient END)
               FROM outbox"#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(OutboxStats {
            total: total as usize,
            pending: pending as usize,
            sent: (total - pending) as usize,
            pending_recipients: recipients as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_and_get() {
        let outbox = Outbox::open_in_memory().unwrap();
        let id = outbox.enqueue("a.onion", "b.onion", b"hello").unwrap();
        assert!(id > 0);

        let entry = outbox.get(id).unwrap().unwrap();
        assert_eq!(entry.sender, "a.onion");
        assert_eq!(entry.recipient, "b.onion");
        assert_eq!(entry.body(), "hello");
        assert!(!entry.sent);
        assert!(outbox.get(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_drain_pending_oldest_first() {
        let outbox = Outbox::open_in_memory().unwrap();
        let first = outbox.enqueue("a.onion", "b.onion", b"1").unwrap();
        let second = outbox.enqueue("a.onion", "c.onion", b"2").unwrap();
        let third = outbox.enqueue("a.onion", "b.onion", b"3").unwrap();

        let ids: Vec<_> = outbox.drain_pending().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, second, third]);

        outbox.mark_delivered(second).unwrap();
        let ids: Vec<_> = outbox.drain_pending().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, third]);

        let for_b: Vec<_> = outbox.pending_for("b.onion").unwrap().iter().map(|e| e.id).collect();
        assert_eq!(for_b, vec![first, third]);
    }

    #[test]
    fn test_mark_delivered_idempotent() {
        let outbox = Outbox::open_in_memory().unwrap();
        let id = outbox.enqueue("a.onion", "b.onion", b"x").unwrap();

        outbox.mark_delivered(id).unwrap();
        outbox.mark_delivered(id).unwrap();
        assert!(outbox.get(id).unwrap().unwrap().sent);
        assert!(outbox.drain_pending().unwrap().is_empty());

        assert!(matches!(outbox.mark_delivered(9999), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");

        let id = {
            let outbox = Outbox::open(&path).unwrap();
            outbox.enqueue("a.onion", "b.onion", b"durable").unwrap()
        };

        let reopened = Outbox::open(&path).unwrap();
        let pending = reopened.drain_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, b"durable");
        assert!(!pending[0].sent);
    }

    #[test]
    fn test_stats() {
        let outbox = Outbox::open_in_memory().unwrap();
        assert_eq!(outbox.stats().unwrap(), OutboxStats::default());

        let a = outbox.enqueue("a.onion", "b.onion", b"1").unwrap();
        outbox.enqueue("a.onion", "b.onion", b"2").unwrap();
        outbox.enqueue("a.onion", "c.onion", b"3").unwrap();
        outbox.mark_delivered(a).unwrap();

        let stats = outbox.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending_recipients, 2);
    }
}
