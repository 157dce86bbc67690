//! Anonymizing transport integration.
//!
//! Launches and supervises a local Tor process that publishes this node's
//! rendezvous address and provides the SOCKS5 proxy every outbound link is
//! dialed through.
//!
//! ## Design
//!
//! The process is spawned with a generated configuration file and watched
//! through its log output. Peers are reached only through the proxy; there
//! is no clearnet fallback.

mod bootstrap;
mod connection;
mod controller;

pub use bootstrap::{
    parse_bootstrap_percent, render_torrc, rendezvous_address, TransportBootstrap,
    TransportSnapshot, TransportStatus,
};
pub use connection::{probe_port, SocksProxy};
pub use controller::{ControlAuth, ProtocolInfo, TorController};

/// Connection timeout for Tor circuits (seconds).
pub const CIRCUIT_TIMEOUT_SECS: u64 = 120;
