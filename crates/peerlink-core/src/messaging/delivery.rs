//! Outbox drain: hands pending entries to connected links.
//!
//! A single worker drains on a fixed period and whenever it is triggered
//! (right after an enqueue). Entries are tried oldest first; once one entry
//! for a recipient fails, the rest of that recipient's entries wait for the
//! next cycle.

use crate::error::Result;
use crate::link::{Frame, LinkSupervisor};
use crate::logging::RedactedAddress;
use crate::storage::{Outbox, OutboxEntry};
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where drained frames go.
pub trait LinkRouter: Send + Sync {
    /// Whether a connected link to `recipient` exists.
    fn is_connected(&self, recipient: &str) -> bool;

    /// Send `frame` to `recipient`.
    fn send<'a>(&'a self, recipient: &'a str, frame: &'a Frame) -> BoxFuture<'a, Result<()>>;
}

impl LinkRouter for LinkSupervisor {
    fn is_connected(&self, recipient: &str) -> bool {
        self.link_for(recipient)
            .map(|link| link.is_connected())
            .unwrap_or(false)
    }

    fn send<'a>(&'a self, recipient: &'a str, frame: &'a Frame) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_to(recipient, frame))
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Entries that were pending at the start of the cycle.
    pub pending: usize,
    /// Entries a send was attempted for.
    pub attempted: usize,
    /// Entries handed to a link and marked sent.
    pub delivered: Vec<OutboxEntry>,
}

/// Run one drain cycle.
pub async fn drain_once(outbox: &Outbox, router: &dyn LinkRouter) -> Result<DrainReport> {
    let pending = outbox.drain_pending()?;
    let mut report = DrainReport {
        pending: pending.len(),
        ..Default::default()
    };
    let mut blocked: HashSet<String> = HashSet::new();

    for mut entry in pending {
        if blocked.contains(&entry.recipient) {
            continue;
        }
        if !router.is_connected(&entry.recipient) {
            blocked.insert(entry.recipient.clone());
            continue;
        }

        report.attempted += 1;
        let frame = Frame::payload(entry.sender.as_str(), entry.body());
        match router.send(&entry.recipient, &frame).await {
            Ok(()) => {
                outbox.mark_delivered(entry.id)?;
                entry.sent = true;
                debug!(id = entry.id, to = %RedactedAddress(&entry.recipient), "Outbox entry delivered");
                report.delivered.push(entry);
            }
            Err(e) => {
                debug!(id = entry.id, error = %e, "Delivery failed, leaving entry pending");
                blocked.insert(entry.recipient.clone());
            }
        }
    }

    Ok(report)
}

/// Background task draining the outbox.
pub struct OutboxWorker {
    outbox: Outbox,
    router: Arc<dyn LinkRouter>,
    period: Duration,
    trigger: Arc<Notify>,
}

impl OutboxWorker {
    /// Worker draining every `period`.
    pub fn new(outbox: Outbox, router: Arc<dyn LinkRouter>, period: Duration) -> Self {
        Self {
            outbox,
            router,
            period: period.max(Duration::from_millis(1)),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle that starts a drain cycle when notified.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Spawn the worker. `on_report` sees every cycle that delivered
    /// something.
    pub fn spawn<F>(self, on_report: F) -> JoinHandle<()>
    where
        F: Fn(&DrainReport) + Send + 'static,
    {
        tokio::spawn(async move {
            info!(period_ms = self.period.as_millis() as u64, "Outbox worker started");
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.trigger.notified() => {}
                }

                match drain_once(&self.outbox, self.router.as_ref()).await {
                    Ok(report) => {
                        if !report.delivered.is_empty() {
                            on_report(&report);
                        }
                    }
                    Err(e) => warn!(error = %e, "Outbox drain failed"),
                }
            }
        })
    }
}
