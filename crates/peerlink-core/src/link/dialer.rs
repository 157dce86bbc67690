//! Opening WebSocket streams to rendezvous addresses.

use crate::error::{Error, Result};
use crate::logging::RedactedAddress;
use crate::tor::SocksProxy;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::debug;

/// A connected link stream.
pub type LinkStream = WebSocketStream<TcpStream>;

/// Opens streams to rendezvous addresses.
pub trait Dialer: Send + Sync + 'static {
    /// Dial `address` and complete the WebSocket handshake.
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<LinkStream>>;
}

/// Dials through the transport's SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy: SocksProxy,
    handshake_timeout: Duration,
}

impl SocksDialer {
    /// Dialer using `proxy`, bounding the whole dial by `timeout`.
    pub fn new(proxy: SocksProxy, timeout: Duration) -> Self {
        let proxy = SocksProxy { timeout, ..proxy };
        Self {
            proxy,
            handshake_timeout: timeout,
        }
    }
}

impl Dialer for SocksDialer {
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<LinkStream>> {
        Box::pin(async move {
            let (host, port) = parse_target(address)?;
            debug!(peer = %RedactedAddress(address), "Dialing through proxy");
            let tcp = self.proxy.connect(&host, port).await?;
            upgrade(address, tcp, self.handshake_timeout).await
        })
    }
}

/// Dials plain TCP, for loopback peers and tests.
///
/// Addresses with a registered route go to that socket; anything else must
/// carry a literal `host:port`.
#[derive(Debug)]
pub struct DirectDialer {
    routes: RwLock<HashMap<String, SocketAddr>>,
    timeout: Duration,
}

impl DirectDialer {
    /// Dialer with no routes.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            timeout: Duration::from_secs(10),
        }
    }

    /// Send connections for `address` to `target`.
    pub fn route(&self, address: impl Into<String>, target: SocketAddr) {
        let mut routes = match self.routes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes.insert(address.into(), target);
    }

    fn lookup(&self, address: &str) -> Option<SocketAddr> {
        let routes = match self.routes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes.get(address).copied()
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for DirectDialer {
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<LinkStream>> {
        Box::pin(async move {
            let tcp = match self.lookup(address) {
                Some(target) => TcpStream::connect(target).await,
                None => {
                    let (host, port) = parse_target(address)?;
                    TcpStream::connect((host.as_str(), port)).await
                }
            }
            .map_err(|e| Error::Link(format!("connect failed: {}", e)))?;
            upgrade(address, tcp, self.timeout).await
        })
    }
}

async fn upgrade(address: &str, tcp: TcpStream, timeout: Duration) -> Result<LinkStream> {
    let url = websocket_url(address);
    let (stream, _response) = tokio::time::timeout(timeout, client_async(url.as_str(), tcp))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(stream)
}

/// Full WebSocket URL for an address that may omit the scheme.
pub fn websocket_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}/", address)
    }
}

/// Host and port to dial for `address` (port 80 when absent).
pub fn parse_target(address: &str) -> Result<(String, u16)> {
    let uri: Uri = websocket_url(address)
        .parse()
        .map_err(|e| Error::Link(format!("invalid address: {}", e)))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Link("address has no host".into()))?;
    Ok((host.to_string(), uri.port_u16().unwrap_or(80)))
}
