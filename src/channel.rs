//! Command channel: the append-only per-room log controllers write to and the
//! executor consumes.
//!
//! A new listener is handed the whole historical log first. Only `pending`
//! envelopes are yielded, so re-subscribing never reprocesses terminal work.

use futures_util::Stream;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::{CastError, Result};
use crate::model::{now_ms, Command, CommandEnvelope, CommandStatus, Origin, RoomCode};
use crate::store::{LogEvent, RealtimeStore};

/// Pause between log re-reads while the store is unavailable.
const RESYNC_BACKOFF: Duration = Duration::from_millis(250);

/// Sends commands into a room and opens pending-command listeners.
#[derive(Clone)]
pub struct CommandChannel {
    store: Arc<dyn RealtimeStore>,
}

impl CommandChannel {
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self { store }
    }

    /// Append a new pending envelope carrying `command`. Existing entries are
    /// never touched.
    pub async fn send_command(
        &self,
        code: &RoomCode,
        command: Command,
        origin: Origin,
    ) -> Result<CommandEnvelope> {
        let envelope = CommandEnvelope::pending(command, origin, now_ms());
        self.store.append_command(code, envelope.clone()).await?;
        debug!(
            target: "castsync::channel",
            room = %code,
            command = %envelope.command,
            id = %envelope.id,
            "command sent"
        );
        Ok(envelope)
    }

    /// Subscribe to pending envelopes, historical ones first, in log order.
    pub async fn listen(&self, code: &RoomCode) -> Result<PendingCommands> {
        let (history, rx) = self.store.watch_commands(code).await?;
        let backlog = history
            .into_iter()
            .filter(|env| env.status == CommandStatus::Pending)
            .collect();
        Ok(PendingCommands {
            code: code.clone(),
            store: Arc::clone(&self.store),
            backlog,
            rx,
            seen: HashSet::new(),
            resync: false,
            closed: false,
        })
    }
}

/// A live feed of pending envelopes for one room.
///
/// Never yields the same envelope id twice. Ends when the room is deleted.
pub struct PendingCommands {
    code: RoomCode,
    store: Arc<dyn RealtimeStore>,
    backlog: VecDeque<CommandEnvelope>,
    rx: broadcast::Receiver<LogEvent>,
    seen: HashSet<String>,
    resync: bool,
    closed: bool,
}

impl PendingCommands {
    pub fn room(&self) -> &RoomCode {
        &self.code
    }

    /// Hand an envelope back so the next call yields it again, ahead of
    /// anything queued behind it. Used when claiming it failed transiently.
    pub fn requeue(&mut self, envelope: CommandEnvelope) {
        self.seen.remove(&envelope.id);
        self.backlog.push_front(envelope);
    }

    /// Next pending envelope, or `None` once the room is gone.
    pub async fn next(&mut self) -> Option<CommandEnvelope> {
        loop {
            if let Some(env) = self.backlog.pop_front() {
                if self.seen.insert(env.id.clone()) {
                    return Some(env);
                }
                continue;
            }
            if self.closed {
                return None;
            }
            if self.resync {
                self.reread().await;
                continue;
            }
            match self.rx.recv().await {
                Ok(LogEvent::Added(env)) => {
                    if env.status == CommandStatus::Pending {
                        self.backlog.push_back(env);
                    }
                }
                Ok(LogEvent::Removed(ids)) => {
                    for id in &ids {
                        self.seen.remove(id);
                    }
                }
                Ok(LogEvent::StatusChanged(_)) => {}
                Ok(LogEvent::RoomGone) | Err(RecvError::Closed) => {
                    self.closed = true;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "castsync::channel",
                        room = %self.code,
                        skipped,
                        "listener lagged, re-reading command log"
                    );
                    self.resync = true;
                }
            }
        }
    }

    async fn reread(&mut self) {
        match self.store.commands(&self.code).await {
            Ok(log) => {
                self.resync = false;
                self.backlog.extend(
                    log.into_iter()
                        .filter(|env| env.status == CommandStatus::Pending && !self.seen.contains(&env.id)),
                );
            }
            Err(CastError::RoomNotFound(_)) => self.closed = true,
            Err(err) => {
                debug!(target: "castsync::channel", room = %self.code, error = %err, "log re-read failed, retrying");
                tokio::time::sleep(RESYNC_BACKOFF).await;
            }
        }
    }

    /// Adapt into a `Stream` of pending envelopes.
    pub fn into_stream(self) -> impl Stream<Item = CommandEnvelope> + Send {
        futures_util::stream::unfold(self, |mut feed| async move {
            feed.next().await.map(|env| (env, feed))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
