//! Peer links.
//!
//! One outbound [`PeerLink`] per remote peer, dialed through a [`Dialer`]
//! and kept alive by its own reconnect loop. [`LinkSupervisor`] owns the
//! inbound listener and provisions the outbound link for the active
//! conversation. Everything that arrives is classified into [`Frame`]s.

mod backoff;
mod dialer;
mod frame;
mod peer_link;
mod supervisor;

pub use backoff::BackoffPolicy;
pub use dialer::{parse_target, websocket_url, Dialer, DirectDialer, LinkStream, SocksDialer};
pub use frame::{Frame, HANDSHAKE_PREFIX, PAYLOAD_PREFIX};
pub use peer_link::{InboundFrames, LinkState, PeerLink};
pub use supervisor::{
    ConnectionStatus, InboundEvent, InboundEvents, InboundSource, LinkSupervisor,
};
