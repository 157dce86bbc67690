//! Minimal transport control-port client.
//!
//! Only what the bootstrap lifecycle needs: authenticate and send signals.
//! The protocol is line based; replies start with a three digit status code
//! followed by `-` (more lines follow) or a space (final line).

use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Authentication method for the control port.
#[derive(Debug, Clone)]
pub enum ControlAuth {
    /// No authentication required.
    None,
    /// Cookie authentication (reads from file).
    Cookie(String),
    /// Password authentication.
    Password(String),
}

/// Information from a PROTOCOLINFO reply.
#[derive(Debug, Default)]
pub struct ProtocolInfo {
    /// Available authentication methods.
    pub auth_methods: Vec<String>,
    /// Cookie file for cookie authentication.
    pub cookie_file: Option<String>,
}

/// Control-port connection.
pub struct TorController {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    authenticated: bool,
}

impl TorController {
    /// Connect to the control port.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to control port: {}", e)))?;

        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            authenticated: false,
        })
    }

    /// Send a command and collect the reply lines.
    async fn command(&mut self, cmd: &str) -> Result<Vec<String>> {
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("failed to send command: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush: {}", e)))?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Transport(format!("failed to read reply: {}", e)))?;
            if n == 0 {
                return Err(Error::Transport("control connection closed".into()));
            }

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let (code, rest) = parse_reply_line(line)
                .ok_or_else(|| Error::Transport(format!("malformed reply: {}", line)))?;

            if !code.starts_with('2') {
                return Err(Error::Transport(format!("control port error: {}", line)));
            }

            lines.push(rest.text.to_string());
            if rest.is_final {
                break;
            }
        }

        Ok(lines)
    }

    /// Ask which authentication methods are accepted.
    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let lines = self.command("PROTOCOLINFO 1").await?;
        Ok(parse_protocol_info(&lines))
    }

    /// Authenticate with the given method.
    pub async fn authenticate(&mut self, auth: ControlAuth) -> Result<()> {
        let cmd = match auth {
            ControlAuth::None => "AUTHENTICATE".to_string(),
            ControlAuth::Cookie(path) => {
                let cookie = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Transport(format!("failed to read cookie file: {}", e)))?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
            ControlAuth::Password(password) => {
                format!("AUTHENTICATE \"{}\"", escape_control_string(&password))
            }
        };

        self.command(&cmd).await?;
        self.authenticated = true;

        tracing::debug!("Authenticated with control port");
        Ok(())
    }

    /// Authenticate with whatever the port advertises, preferring cookies.
    pub async fn authenticate_auto(&mut self) -> Result<()> {
        let info = self.protocol_info().await?;

        let has = |m: &str| info.auth_methods.iter().any(|a| a == m);

        if has("COOKIE") || has("SAFECOOKIE") {
            if let Some(cookie_path) = &info.cookie_file {
                match self.authenticate(ControlAuth::Cookie(cookie_path.clone())).await {
                    Ok(()) => return Ok(()),
                    Err(e) => tracing::debug!(error = %e, "Cookie authentication failed"),
                }
            }
        }

        if has("NULL") {
            return self.authenticate(ControlAuth::None).await;
        }

        Err(Error::Transport("no usable control port authentication".into()))
    }

    /// Send a signal such as `HALT` or `NEWNYM`.
    pub async fn signal(&mut self, signal: &str) -> Result<()> {
        if !self.authenticated {
            return Err(Error::Transport("not authenticated".into()));
        }

        self.command(&format!("SIGNAL {}", signal)).await?;
        Ok(())
    }
}

struct ReplyRest<'a> {
    text: &'a str,
    is_final: bool,
}

fn parse_reply_line(line: &str) -> Option<(&str, ReplyRest<'_>)> {
    let code = line.get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let separator = line.as_bytes().get(3).copied().unwrap_or(b' ');
    let text = line.get(4..).unwrap_or("");
    Some((
        code,
        ReplyRest {
            text,
            is_final: separator == b' ',
        },
    ))
}

fn parse_protocol_info(lines: &[String]) -> ProtocolInfo {
    let mut info = ProtocolInfo::default();

    for line in lines {
        // AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/path"
        let Some(auth_part) = line.strip_prefix("AUTH ") else {
            continue;
        };
        if let Some(start) = auth_part.find("METHODS=") {
            let after = &auth_part[start + "METHODS=".len()..];
            let end = after.find(' ').unwrap_or(after.len());
            info.auth_methods = after[..end].split(',').map(String::from).collect();
        }
        if let Some(start) = auth_part.find("COOKIEFILE=\"") {
            let after = &auth_part[start + "COOKIEFILE=\"".len()..];
            if let Some(end) = after.find('"') {
                info.cookie_file = Some(after[..end].to_string());
            }
        }
    }

    info
}

fn escape_control_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
