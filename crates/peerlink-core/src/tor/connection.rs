//! Outbound streams through the transport's SOCKS5 proxy.
//!
//! Onion hostnames must be resolved by the proxy, so the CONNECT request
//! always uses the domain-name address type.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Where and how to reach the SOCKS5 proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksProxy {
    /// Proxy address.
    pub addr: SocketAddr,
    /// Timeout for the TCP connect plus SOCKS negotiation.
    pub timeout: Duration,
}

impl SocksProxy {
    /// Proxy at `addr` with the default circuit timeout.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(super::CIRCUIT_TIMEOUT_SECS),
        }
    }

    /// Open a stream to `host:port` through the proxy.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| Error::Link(format!("failed to connect to SOCKS proxy: {}", e)))?;
            socks5_handshake(&mut stream, host, port).await?;
            Ok(stream)
        })
        .await
        .map_err(|_| Error::Timeout)?
    }
}

/// Check whether something accepts TCP connections on `addr`.
pub async fn probe_port(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Perform the SOCKS5 greeting and CONNECT on an open proxy stream.
async fn socks5_handshake(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    // Version 5, 1 auth method (no auth = 0x00)
    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| Error::Link(format!("SOCKS5 greeting failed: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Link(format!("SOCKS5 response failed: {}", e)))?;

    if response[0] != 0x05 || response[1] != 0x00 {
        return Err(Error::Link("SOCKS5 authentication failed".into()));
    }

    let request = connect_request(host, port)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::Link(format!("SOCKS5 connect failed: {}", e)))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Link(format!("SOCKS5 connect response failed: {}", e)))?;

    if header[0] != 0x05 {
        return Err(Error::Link("invalid SOCKS5 version in response".into()));
    }

    if header[1] != 0x00 {
        return Err(Error::Link(format!(
            "SOCKS5 connect failed: {}",
            reply_reason(header[1])
        )));
    }

    // Bound address is unused but must be consumed.
    let remaining = match header[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| Error::Link(e.to_string()))?;
            len[0] as usize + 2
        }
        _ => return Err(Error::Link("invalid SOCKS5 address type".into())),
    };
    let mut buf = vec![0u8; remaining];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Link(e.to_string()))?;

    Ok(())
}

/// Build a CONNECT request with a domain-name target.
fn connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let host_bytes = host.as_bytes();
    if host_bytes.is_empty() || host_bytes.len() > 255 {
        return Err(Error::Link("invalid SOCKS5 hostname length".into()));
    }

    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.push(0x05); // Version
    request.push(0x01); // Connect
    request.push(0x00); // Reserved
    request.push(0x03); // Domain name
    request.push(host_bytes.len() as u8);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
