//! Database schema definitions.
//!
//! Every table lives in one database file. Each store creates the tables it
//! needs, so a store can also be opened on its own.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// Contacts, message history and settings.
pub const CREATE_SCHEMA: &str = r#"
-- Known peers
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL UNIQUE,
    display_name TEXT,
    created_at INTEGER NOT NULL
);

-- Message history per peer
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_address TEXT NOT NULL,
    body TEXT NOT NULL,
    outgoing INTEGER NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages(peer_address, timestamp);

-- Settings table
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;

/// Durable outbound queue.
pub const CREATE_OUTBOX: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    payload BLOB NOT NULL,
    sent INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(sent, id);
"#;

/// Per-peer handshake state.
pub const CREATE_HANDSHAKE_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS handshake_state (
    peer TEXT PRIMARY KEY,
    state BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
