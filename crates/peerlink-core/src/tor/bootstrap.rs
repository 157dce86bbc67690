//! Transport process lifecycle.
//!
//! [`TransportBootstrap`] owns the anonymizing network process: it writes the
//! process configuration, launches it, follows its log for bootstrap
//! progress and publishes the rendezvous address once the SOCKS port is
//! reachable. State is published through a `watch` channel so any number of
//! observers can poll or await it.

use super::connection::{probe_port, SocksProxy};
use super::controller::TorController;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::logging::RedactedAddress;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between readiness checks while bootstrapping.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for a single SOCKS port probe.
const SOCKS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts at reading the hostname file after bootstrap completes.
const HOSTNAME_READ_ATTEMPTS: u32 = 20;

/// Coarse lifecycle of the transport process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// No process running.
    Stopped,
    /// Process is being prepared and launched.
    Starting,
    /// Process is running and reported this bootstrap percentage.
    Bootstrapping(u8),
    /// Bootstrap finished, SOCKS port reachable, address published.
    Ready,
    /// Start failed; `stop` must be called before retrying.
    Error(String),
}

impl TransportStatus {
    /// Human-readable status line.
    pub fn describe(&self) -> String {
        match self {
            TransportStatus::Stopped => "Stopped".to_string(),
            TransportStatus::Starting => "Starting Tor...".to_string(),
            TransportStatus::Bootstrapping(p) => match p {
                0..=25 => "Connecting to Tor network...".to_string(),
                26..=50 => "Downloading directory info...".to_string(),
                51..=75 => "Building circuits...".to_string(),
                _ => "Establishing connections...".to_string(),
            },
            TransportStatus::Ready => "Tor Ready".to_string(),
            TransportStatus::Error(reason) => format!("Error: {}", reason),
        }
    }
}

/// Everything observers can read about the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSnapshot {
    /// Current status.
    pub status: TransportStatus,
    /// Last reported bootstrap percentage (0-100).
    pub bootstrap_percent: u8,
    /// Published rendezvous address, present only while ready.
    pub rendezvous_address: Option<String>,
}

impl TransportSnapshot {
    /// Snapshot of a stopped transport.
    pub fn stopped() -> Self {
        Self {
            status: TransportStatus::Stopped,
            bootstrap_percent: 0,
            rendezvous_address: None,
        }
    }

    /// Snapshot of a ready transport publishing `address`.
    pub fn ready(address: impl Into<String>) -> Self {
        Self {
            status: TransportStatus::Ready,
            bootstrap_percent: 100,
            rendezvous_address: Some(address.into()),
        }
    }

    /// Whether message delivery may proceed.
    pub fn is_ready(&self) -> bool {
        self.status == TransportStatus::Ready
    }
}

/// Manages the anonymizing network process.
pub struct TransportBootstrap {
    config: TransportConfig,
    state: watch::Sender<TransportSnapshot>,
    process: Arc<TokioMutex<Option<Child>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportBootstrap {
    /// Create a stopped transport.
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let (state, _) = watch::channel(TransportSnapshot::stopped());
        Arc::new(Self {
            config,
            state,
            process: Arc::new(TokioMutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the process in the background.
    ///
    /// No-op unless the transport is `Stopped`. Returns immediately; progress
    /// is observable through [`subscribe`](Self::subscribe).
    pub fn start(self: &Arc<Self>) {
        let claimed = self.state.send_if_modified(|s| {
            if s.status == TransportStatus::Stopped {
                *s = TransportSnapshot {
                    status: TransportStatus::Starting,
                    bootstrap_percent: 0,
                    rendezvous_address: None,
                };
                true
            } else {
                false
            }
        });

        if !claimed {
            debug!(status = ?self.status(), "Transport start ignored");
            return;
        }

        info!(binary = %self.config.binary.display(), "Starting transport");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = this.run_startup().await {
                warn!(error = %e, "Transport failed to start");
                this.kill_process().await;
                this.state.send_modify(|s| {
                    s.status = TransportStatus::Error(e.to_string());
                    s.rendezvous_address = None;
                });
            }
        });
        self.track(handle);
    }

    /// Stop the process and reset to `Stopped`. Idempotent.
    pub async fn stop(&self) {
        if self.status() == TransportStatus::Stopped {
            return;
        }

        info!("Stopping transport");

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = self.request_halt().await {
                debug!(error = %e, "Graceful halt unavailable");
            }

            match tokio::time::timeout(self.config.stop_timeout(), child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Transport exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed waiting for transport exit"),
                Err(_) => {
                    warn!("Transport did not exit in time, killing");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill transport");
                    }
                }
            }
        }

        self.state.send_replace(TransportSnapshot::stopped());
        info!("Transport stopped");
    }

    /// Current status.
    pub fn status(&self) -> TransportStatus {
        self.state.borrow().status.clone()
    }

    /// Human-readable status line.
    pub fn status_text(&self) -> String {
        self.state.borrow().status.describe()
    }

    /// Last reported bootstrap percentage.
    pub fn bootstrap_percent(&self) -> u8 {
        self.state.borrow().bootstrap_percent
    }

    /// Whether the transport is ready for delivery.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// SOCKS proxy descriptor.
    pub fn socks_proxy(&self) -> SocksProxy {
        SocksProxy::new(self.config.socks_addr())
    }

    /// Published rendezvous address, if ready.
    pub fn rendezvous_address(&self) -> Option<String> {
        self.state.borrow().rendezvous_address.clone()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TransportSnapshot {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<TransportSnapshot> {
        self.state.subscribe()
    }

    /// Configuration in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut guard) => guard.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    async fn run_startup(self: &Arc<Self>) -> Result<()> {
        self.prepare_data_dir().await?;

        let torrc = self.config.torrc_path();
        tokio::fs::write(&torrc, render_torrc(&self.config))
            .await
            .map_err(|e| Error::Transport(format!("failed to write config: {}", e)))?;
        debug!(path = %torrc.display(), "Wrote transport config");

        let mut child = Command::new(&self.config.binary)
            .arg("-f")
            .arg(&torrc)
            .current_dir(&self.config.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Transport(format!(
                    "failed to launch {}: {}",
                    self.config.binary.display(),
                    e
                ))
            })?;

        if let Some(stdout) = child.stdout.take() {
            let state = self.state.clone();
            self.track(tokio::spawn(follow_log(stdout, state)));
        }
        *self.process.lock().await = Some(child);

        self.wait_until_ready().await?;

        let hostname = self.read_hostname().await?;
        let address = rendezvous_address(&hostname, &self.config);

        info!(address = %RedactedAddress(&address), "Transport ready");

        self.state.send_modify(|s| {
            s.status = TransportStatus::Ready;
            s.bootstrap_percent = 100;
            s.rendezvous_address = Some(address);
        });

        Ok(())
    }

    async fn prepare_data_dir(&self) -> Result<()> {
        let hs_dir = self.config.hidden_service_dir();
        tokio::fs::create_dir_all(&hs_dir)
            .await
            .map_err(|e| Error::Transport(format!("failed to create data dir: {}", e)))?;

        // The process refuses service directories readable by others.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [&self.config.data_dir, &hs_dir] {
                tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                    .await
                    .map_err(|e| Error::Transport(format!("failed to restrict data dir: {}", e)))?;
            }
        }

        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.bootstrap_timeout();
        let socks = self.config.socks_addr();

        loop {
            if let Some(exit) = self.exited().await {
                return Err(Error::Transport(format!("process exited early ({})", exit)));
            }

            if self.bootstrap_percent() >= 100 && probe_port(socks, SOCKS_PROBE_TIMEOUT).await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Transport(format!(
                    "SOCKS port {} not ready after {}s",
                    socks.port(),
                    self.config.bootstrap_timeout_secs
                )));
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn exited(&self) -> Option<String> {
        let mut guard = self.process.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    async fn read_hostname(&self) -> Result<String> {
        let path = self.config.hidden_service_dir().join("hostname");
        for _ in 0..HOSTNAME_READ_ATTEMPTS {
            if let Ok(raw) = tokio::fs::read_to_string(&path).await {
                let hostname = raw.trim();
                if !hostname.is_empty() {
                    return Ok(hostname.to_string());
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(Error::Transport(format!(
            "hostname file {} never appeared",
            path.display()
        )))
    }

    async fn request_halt(&self) -> Result<()> {
        let halt = async {
            let mut controller = TorController::connect(self.config.control_addr()).await?;
            controller.authenticate_auto().await?;
            controller.signal("HALT").await
        };
        tokio::time::timeout(Duration::from_secs(2), halt)
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn kill_process(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Failed to kill transport after start failure");
            }
        }
    }
}

/// Follow the process log, updating bootstrap progress.
async fn follow_log(stdout: ChildStdout, state: watch::Sender<TransportSnapshot>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "tor", "{}", line);
                if let Some(percent) = parse_bootstrap_percent(&line) {
                    state.send_if_modified(|s| match s.status {
                        TransportStatus::Starting | TransportStatus::Bootstrapping(_) => {
                            s.status = TransportStatus::Bootstrapping(percent);
                            s.bootstrap_percent = percent;
                            true
                        }
                        _ => false,
                    });
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Transport log stream failed");
                break;
            }
        }
    }
}

/// Extract the percentage from a `Bootstrapped NN%` log line.
pub fn parse_bootstrap_percent(line: &str) -> Option<u8> {
    const MARKER: &str = "Bootstrapped ";
    let start = line.find(MARKER)? + MARKER.len();
    let rest = &line[start..];
    let end = rest.find('%')?;
    let percent: u8 = rest[..end].trim().parse().ok()?;
    (percent <= 100).then_some(percent)
}

/// Render the process configuration file.
pub fn render_torrc(config: &TransportConfig) -> String {
    let data_dir = config.data_dir.display();
    let hs_dir = config.hidden_service_dir();
    format!(
        "# Generated by peerlink\n\
         DataDirectory {data_dir}\n\
         SocksPort {socks}\n\
         ControlPort {control}\n\
         ControlPortWriteToFile {data_dir}/control_port\n\
         CookieAuthentication 0\n\
         HiddenServiceDir {hs_dir}\n\
         HiddenServicePort {virt} 127.0.0.1:{listen}\n\
         HiddenServiceVersion 3\n\
         Log notice stdout\n\
         ClientOnly 1\n",
        data_dir = data_dir,
        socks = config.socks_port,
        control = config.control_port,
        hs_dir = hs_dir.display(),
        virt = config.virtual_port,
        listen = config.listen_port,
    )
}

/// Dialable rendezvous address for a published hostname.
pub fn rendezvous_address(hostname: &str, config: &TransportConfig) -> String {
    format!(
        "ws://{}:{}{}",
        hostname, config.virtual_port, config.service_path
    )
}
