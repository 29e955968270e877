//! The player end of a room.
//!
//! Attaching creates a room (no code given) or joins one, takes the room's
//! executor lease, and starts two background loops: the command executor and
//! the playback driver. Both stop on their own when the room is deleted.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CastConfig;
use crate::driver::PlaybackDriver;
use crate::error::{CastError, Result};
use crate::executor::{CommandExecutor, RoomLocks};
use crate::model::{Identity, RoomCode};
use crate::registry::{LeaveOutcome, RoomRegistry};
use crate::store::RealtimeStore;
use crate::widget::{PlaybackWidget, WidgetEvent};

const EVENT_BUFFER: usize = 64;

/// A running player attached to one room.
pub struct PlayerSession {
    code: RoomCode,
    identity: Identity,
    is_host: bool,
    registry: RoomRegistry,
    executor: Arc<CommandExecutor>,
    events: mpsc::Sender<WidgetEvent>,
    executor_task: JoinHandle<Result<u64>>,
    driver_task: JoinHandle<Result<()>>,
}

impl PlayerSession {
    /// Attach to `code`, or create a fresh room hosted by `identity` when
    /// `code` is `None`.
    ///
    /// Fails with `RoomNotFound` for an unknown code and `LeaseHeld` when
    /// another player already drives the room.
    pub async fn attach(
        code: Option<RoomCode>,
        identity: Identity,
        store: Arc<dyn RealtimeStore>,
        widget: Arc<dyn PlaybackWidget>,
        config: &CastConfig,
    ) -> Result<Self> {
        let registry = RoomRegistry::new(Arc::clone(&store)).with_max_attempts(config.rooms.max_code_attempts);
        let locks = RoomLocks::new();
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&store),
            Arc::clone(&widget),
            locks.clone(),
            config.executor(),
        ));

        // The lease is taken before joining so a refused player never shows
        // up in `participants`.
        let (code, is_host) = match code {
            Some(code) => {
                executor.claim(&code).await?;
                match registry.join_room(&code, &identity).await {
                    Ok(joined) => (code, joined.is_host),
                    Err(err) => {
                        release(&registry, &code, executor.owner()).await;
                        return Err(err);
                    }
                }
            }
            None => {
                let code = registry.create_room(&identity).await?;
                executor.claim(&code).await?;
                (code, true)
            }
        };

        let driver = Arc::new(
            PlaybackDriver::new(store, widget, locks)
                .with_progress_interval(config.progress_interval())
                .with_retry_backoff(config.executor().retry_backoff),
        );
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let executor_task = Arc::clone(&executor).spawn(code.clone());
        let driver_task = driver.spawn(code.clone(), events_rx);

        info!(target: "castsync::player", room = %code, player = %identity.id, is_host, "player attached");
        Ok(Self {
            code,
            identity,
            is_host,
            registry,
            executor,
            events,
            executor_task,
            driver_task,
        })
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Sender for widget callbacks (ready, state change, error, ended).
    pub fn events(&self) -> mpsc::Sender<WidgetEvent> {
        self.events.clone()
    }

    /// Forward one widget callback to the playback driver.
    pub async fn widget_event(&self, event: WidgetEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| CastError::Widget("playback driver stopped".to_string()))
    }

    /// Wait for the executor loop to finish (the room was deleted or the
    /// lease was lost). Returns how many commands it processed.
    pub async fn wait(self) -> Result<u64> {
        let processed = join(self.executor_task).await?;
        join(self.driver_task).await?;
        Ok(processed)
    }

    /// Leave the room and stop both loops. As host this deletes the room.
    pub async fn shutdown(self) -> Result<LeaveOutcome> {
        let outcome = self.registry.leave_room(&self.code, &self.identity).await?;
        self.executor_task.abort();
        self.driver_task.abort();
        release(&self.registry, &self.code, self.executor.owner()).await;
        info!(target: "castsync::player", room = %self.code, ?outcome, "player detached");
        Ok(outcome)
    }
}

async fn release(registry: &RoomRegistry, code: &RoomCode, owner: &str) {
    match registry.store().release_lease(code, owner).await {
        Ok(()) | Err(CastError::RoomNotFound(_)) => {}
        Err(err) => debug!(target: "castsync::player", room = %code, error = %err, "lease release failed"),
    }
}

async fn join<T>(task: JoinHandle<Result<T>>) -> Result<T> {
    task.await
        .map_err(|e| CastError::CommandExecution(format!("background task failed: {e}")))?
}
