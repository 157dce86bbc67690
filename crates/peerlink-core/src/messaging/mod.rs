//! Message delivery and the node facade.
//!
//! Outgoing messages are written to the outbox before any delivery attempt;
//! [`OutboxWorker`] hands them to the connected link as
//! `FROM:<sender> <payload>` frames. [`PeerNode`] ties the transport, link
//! supervisor, handshake and outbox together for one active conversation.

mod delivery;
mod node;

pub use delivery::{drain_once, DrainReport, LinkRouter, OutboxWorker};
pub use node::{NodeEvent, PeerNode, LOCAL_ADDRESS_KEY};
