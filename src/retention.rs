//! # Stage: Retention
//!
//! ## Responsibility
//! Periodically delete terminal (`completed` / `failed`) envelopes whose
//! timestamp is older than the retention window.
//!
//! ## Guarantees
//! - `pending` and `executing` envelopes are never deleted, whatever their age
//! - A room deleted mid-sweep is skipped, not reported as an error
//!
//! ## NOT Responsible For
//! - Deleting rooms (rooms live until the host leaves)
//! - Resolving stuck envelopes (they are only reported)

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CastError, Result};
use crate::model::{now_ms, CommandEnvelope};
use crate::store::RealtimeStore;

/// Default retention window: five minutes.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rooms whose logs were scanned.
    pub rooms: usize,
    /// Envelopes looked at.
    pub scanned: usize,
    /// Envelopes deleted.
    pub deleted: usize,
    /// Non-terminal envelopes older than the window (kept).
    pub stuck: usize,
}

/// Removes expired terminal envelopes from every room's command log.
#[derive(Clone)]
pub struct Retention {
    store: Arc<dyn RealtimeStore>,
    window: Duration,
}

impl Retention {
    pub fn new(store: Arc<dyn RealtimeStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn expired(&self, env: &CommandEnvelope, now: u64) -> bool {
        now.saturating_sub(env.timestamp) > self.window.as_millis() as u64
    }

    /// Sweep every live room once, as of `now` (epoch milliseconds).
    pub async fn sweep(&self, now: u64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for code in self.store.rooms().await? {
            let log = match self.store.commands(&code).await {
                Ok(log) => log,
                Err(CastError::RoomNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            report.rooms += 1;
            report.scanned += log.len();

            let mut doomed = Vec::new();
            for env in log.iter().filter(|env| self.expired(env, now)) {
                if env.status.is_terminal() {
                    doomed.push(env.id.clone());
                } else {
                    report.stuck += 1;
                    warn!(
                        target: "castsync::retention",
                        room = %code,
                        id = %env.id,
                        status = %env.status,
                        age_ms = now.saturating_sub(env.timestamp),
                        "command never reached a terminal status"
                    );
                }
            }
            if doomed.is_empty() {
                continue;
            }
            match self.store.remove_commands(&code, &doomed).await {
                Ok(n) => {
                    report.deleted += n;
                    debug!(target: "castsync::retention", room = %code, deleted = n, "expired commands removed");
                }
                Err(CastError::RoomNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Sweep every `interval` until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.sweep(now_ms()).await {
                    Ok(report) if report.deleted > 0 || report.stuck > 0 => {
                        info!(
                            target: "castsync::retention",
                            rooms = report.rooms,
                            scanned = report.scanned,
                            deleted = report.deleted,
                            stuck = report.stuck,
                            "retention sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(target: "castsync::retention", error = %err, "retention sweep failed"),
                }
            }
        })
    }
}
