//! Local storage.
//!
//! One SQLite database file holds contacts, message history, settings, the
//! outbox and handshake state. Stores share a connection when opened through
//! [`Database::connection`].

mod database;
mod outbox;
mod schema;

pub use database::{Contact, Database, DatabaseConfig, StoredMessage};
pub use outbox::{Outbox, OutboxEntry, OutboxStats};
pub use schema::{CREATE_HANDSHAKE_STATE, SCHEMA_VERSION};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "peerlink.db";
