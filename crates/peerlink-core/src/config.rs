//! Node configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides. Durations are stored as whole seconds or milliseconds to keep
//! the JSON representation flat.

use crate::error::{Error, Result};
use crate::link::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default SOCKS5 proxy port for the transport.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default control port for the transport.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Port published on the rendezvous address.
pub const DEFAULT_VIRTUAL_PORT: u16 = 80;

/// Loopback port the inbound listener binds.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

/// Path component of the rendezvous address.
pub const DEFAULT_SERVICE_PATH: &str = "/chat";

/// Complete configuration for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Transport process settings.
    pub transport: TransportConfig,
    /// Peer link settings.
    pub link: LinkConfig,
    /// Outbox delivery settings.
    pub outbox: OutboxConfig,
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Rebase the transport working directory under `data_dir`.
    pub fn with_data_dir<P: AsRef<Path>>(mut self, data_dir: P) -> Self {
        self.transport.data_dir = data_dir.as_ref().join("tor_data");
        self
    }

    /// Path of the node database under `data_dir`.
    pub fn database_path<P: AsRef<Path>>(data_dir: P) -> PathBuf {
        data_dir.as_ref().join(crate::storage::DEFAULT_DB_NAME)
    }
}

/// Settings for the anonymizing transport process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport executable (looked up on `PATH` when relative).
    pub binary: PathBuf,
    /// Private working directory for the process.
    pub data_dir: PathBuf,
    /// SOCKS5 listen port.
    pub socks_port: u16,
    /// Control listen port.
    pub control_port: u16,
    /// Port published on the rendezvous address.
    pub virtual_port: u16,
    /// Loopback port the published service forwards to.
    pub listen_port: u16,
    /// Path component of the rendezvous address.
    pub service_path: String,
    /// How long to wait for 100% bootstrap plus a reachable SOCKS port.
    pub bootstrap_timeout_secs: u64,
    /// Grace period between the halt request and a forced kill.
    pub stop_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tor"),
            data_dir: PathBuf::from("tor_data"),
            socks_port: DEFAULT_SOCKS_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            virtual_port: DEFAULT_VIRTUAL_PORT,
            listen_port: DEFAULT_LISTEN_PORT,
            service_path: DEFAULT_SERVICE_PATH.to_string(),
            bootstrap_timeout_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

impl TransportConfig {
    /// SOCKS proxy address.
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.socks_port))
    }

    /// Control port address.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.control_port))
    }

    /// Loopback address for the inbound listener.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.listen_port))
    }

    /// Directory holding the published service keys and hostname file.
    pub fn hidden_service_dir(&self) -> PathBuf {
        self.data_dir.join("hidden_service")
    }

    /// Location of the generated configuration file.
    pub fn torrc_path(&self) -> PathBuf {
        self.data_dir.join("torrc")
    }

    /// Bootstrap timeout as a duration.
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// Stop grace period as a duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Settings for outbound peer links and their supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Reconnect delay added per failed attempt, in milliseconds.
    pub backoff_step_ms: u64,
    /// Upper bound on the reconnect delay, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Health check period, in milliseconds.
    pub health_check_ms: u64,
    /// Timeout for one dial through the proxy, in seconds.
    pub dial_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            backoff_step_ms: 1_000,
            backoff_cap_ms: 30_000,
            health_check_ms: 5_000,
            dial_timeout_secs: 120,
        }
    }
}

impl LinkConfig {
    /// Reconnect policy described by this config.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_step_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    /// Health check period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    /// Dial timeout.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Settings for outbox draining.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Period of the background drain, in milliseconds.
    pub drain_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 10_000,
        }
    }
}

impl OutboxConfig {
    /// Drain period.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}
