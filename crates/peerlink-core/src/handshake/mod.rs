//! Per-peer key agreement.

mod coordinator;
mod store;

pub use coordinator::{HandshakeCoordinator, HandshakeOutcome};
pub use store::{
    HandshakePhase, HandshakeStore, MemoryHandshakeStore, SqliteHandshakeStore, StoredHandshake,
};
