//! # Stage: Command Executor
//!
//! ## Responsibility
//! Runs on the player and is the only writer of a room's [`CastState`].
//! For every pending envelope, in arrival order:
//!
//! 1. mark it `executing`
//! 2. compute the next state with [`machine::apply`]
//! 3. persist the whole state in one write
//! 4. for control commands only, call the playback widget
//! 5. mark it `completed`, or `failed` with the error if 2–4 failed
//!
//! ## Guarantees
//! - Per-room serialization: steps 1–5 for one envelope finish before the
//!   next envelope of the same room starts ([`RoomLocks`]). The playback
//!   driver takes the same lock for its own writes.
//! - Single executor per room: [`CommandExecutor::run`] holds a heartbeated
//!   lease and refuses to start (or stops) when another owner holds it.
//! - A failing envelope never stops the loop.
//! - A store outage never stops the loop: an envelope whose claim failed
//!   is retried before any later one, and lease renewal resumes once the
//!   store is back.
//!
//! ## NOT Responsible For
//! - Loading the current video (that is the playback driver)
//! - Reaping stuck `executing` envelopes (nothing does)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::CommandChannel;
use crate::error::{CastError, Result};
use crate::machine::{self, KeyMint, WidgetEffect};
use crate::model::{now_ms, CastState, Command, CommandEnvelope, CommandStatus, RoomCode};
use crate::store::{LeaseOutcome, RealtimeStore};
use crate::widget::PlaybackWidget;

// ---------------------------------------------------------------------------
// RoomLocks
// ---------------------------------------------------------------------------

/// One async mutex per room code.
///
/// Clones share the same lock table.
#[derive(Clone, Default)]
pub struct RoomLocks {
    inner: Arc<Mutex<HashMap<RoomCode, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `code`. Waiters are served in FIFO order.
    pub async fn lock(&self, code: &RoomCode) -> OwnedMutexGuard<()> {
        let room_lock = {
            let mut table = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(table.entry(code.clone()).or_default())
        };
        room_lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted room.
    pub fn forget(&self, code: &RoomCode) {
        if let Ok(mut table) = self.inner.lock() {
            table.remove(code);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Configuration and outcomes
// ---------------------------------------------------------------------------

/// Lease timing for [`CommandExecutor::run`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long a lease stays valid without renewal.
    pub lease_ttl: Duration,
    /// How often the lease is renewed. Must be shorter than `lease_ttl`.
    pub heartbeat: Duration,
    /// Pause between attempts while the store is unavailable.
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            heartbeat: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Terminal result of one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub id: String,
    pub status: CommandStatus,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Applies pending commands to a room's authoritative state.
pub struct CommandExecutor {
    store: Arc<dyn RealtimeStore>,
    widget: Arc<dyn PlaybackWidget>,
    locks: RoomLocks,
    owner: String,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        widget: Arc<dyn PlaybackWidget>,
        locks: RoomLocks,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            widget,
            locks,
            owner: format!("executor-{}", uuid::Uuid::new_v4()),
            config,
        }
    }

    /// Lease owner id of this executor.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn locks(&self) -> &RoomLocks {
        &self.locks
    }

    /// Run steps 1–5 for one envelope while holding the room lock.
    ///
    /// Returns `Err` only when the envelope could not be claimed (already
    /// claimed, unknown, or the store is unreachable); failures after the
    /// claim are recorded on the envelope and reported in the outcome.
    pub async fn execute(&self, code: &RoomCode, envelope: &CommandEnvelope) -> Result<ExecutionOutcome> {
        let _guard = self.locks.lock(code).await;

        self.store
            .set_command_status(code, &envelope.id, CommandStatus::Executing, None)
            .await?;

        let (status, error) = match self.apply(code, &envelope.command).await {
            Ok(()) => (CommandStatus::Completed, None),
            Err(err) => {
                warn!(
                    target: "castsync::executor",
                    room = %code,
                    id = %envelope.id,
                    command = %envelope.command,
                    error = %err,
                    "command failed"
                );
                (CommandStatus::Failed, Some(err.to_string()))
            }
        };

        self.finish(code, &envelope.id, status, error.clone()).await?;
        debug!(
            target: "castsync::executor",
            room = %code,
            id = %envelope.id,
            command = %envelope.command,
            %status,
            "command finished"
        );
        Ok(ExecutionOutcome { id: envelope.id.clone(), status, error })
    }

    /// Record the terminal status. The state write already happened, so an
    /// outage here is waited out rather than leaving the envelope `executing`.
    async fn finish(&self, code: &RoomCode, id: &str, status: CommandStatus, error: Option<String>) -> Result<()> {
        loop {
            match self.store.set_command_status(code, id, status, error.clone()).await {
                Err(CastError::StoreUnavailable(reason)) => {
                    warn!(target: "castsync::executor", room = %code, %id, %reason, "status write failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                other => return other.map(|_| ()),
            }
        }
    }

    async fn apply(&self, code: &RoomCode, command: &Command) -> Result<()> {
        let current = self.store.read_state(code).await?;
        let mut keys = KeyMint::after(&current, now_ms());
        let transition = machine::apply(&current, command, &mut keys);
        if !transition.state.is_consistent() {
            return Err(CastError::CommandExecution(format!(
                "{command} produced an inconsistent state"
            )));
        }
        self.store.write_state(code, transition.state).await?;
        if let Some(effect) = transition.effect {
            drive_widget(self.widget.as_ref(), effect).await?;
        }
        Ok(())
    }

    /// Consume the room's pending commands until the room is deleted or the
    /// lease is lost. Returns how many envelopes were processed.
    pub async fn run(&self, code: &RoomCode) -> Result<u64> {
        self.claim(code).await?;
        info!(target: "castsync::executor", room = %code, owner = %self.owner, "executor started");

        let result = self.consume(code).await;

        if let Err(err) = self.store.release_lease(code, &self.owner).await {
            debug!(target: "castsync::executor", room = %code, error = %err, "lease release skipped");
        }
        self.locks.forget_if_gone(code, self.store.as_ref()).await;
        info!(target: "castsync::executor", room = %code, "executor stopped");
        result
    }

    async fn consume(&self, code: &RoomCode) -> Result<u64> {
        let channel = CommandChannel::new(Arc::clone(&self.store));
        let mut feed = channel.listen(code).await?;
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;
        let mut processed = 0u64;

        loop {
            tokio::select! {
                next = feed.next() => {
                    let Some(envelope) = next else { break };
                    match self.execute(code, &envelope).await {
                        Ok(_) => processed += 1,
                        Err(err) if err.is_transient() => {
                            warn!(
                                target: "castsync::executor",
                                room = %code,
                                id = %envelope.id,
                                error = %err,
                                "claim failed, retrying"
                            );
                            feed.requeue(envelope);
                            tokio::time::sleep(self.config.retry_backoff).await;
                        }
                        Err(err) => warn!(
                            target: "castsync::executor",
                            room = %code,
                            id = %envelope.id,
                            error = %err,
                            "could not claim command"
                        ),
                    }
                }
                _ = heartbeat.tick() => {
                    match self.claim(code).await {
                        Ok(()) => {}
                        Err(CastError::RoomNotFound(_)) => break,
                        Err(err @ CastError::LeaseHeld { .. }) => return Err(err),
                        Err(err) if err.is_transient() => {
                            warn!(target: "castsync::executor", room = %code, error = %err, "lease renewal failed");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(processed)
    }

    /// Acquire or renew this executor's lease on `code`.
    pub async fn claim(&self, code: &RoomCode) -> Result<()> {
        let ttl_ms = self.config.lease_ttl.as_millis() as u64;
        match self.store.acquire_lease(code, &self.owner, now_ms(), ttl_ms).await? {
            LeaseOutcome::Acquired { .. } => Ok(()),
            LeaseOutcome::Held { owner, .. } => {
                warn!(target: "castsync::executor", room = %code, %owner, "room driven by another executor");
                Err(CastError::LeaseHeld { room: code.to_string(), owner })
            }
        }
    }

    /// Run [`CommandExecutor::run`] on a background task.
    pub fn spawn(self: Arc<Self>, code: RoomCode) -> JoinHandle<Result<u64>> {
        tokio::spawn(async move { self.run(&code).await })
    }
}

impl RoomLocks {
    async fn forget_if_gone(&self, code: &RoomCode, store: &dyn RealtimeStore) {
        if let Ok(false) = store.room_exists(code).await {
            self.forget(code);
        }
    }
}

/// Map a control effect to the widget call it requires.
pub(crate) async fn drive_widget(widget: &dyn PlaybackWidget, effect: WidgetEffect) -> Result<()> {
    match effect {
        WidgetEffect::Play => widget.play().await,
        WidgetEffect::Pause => widget.pause().await,
        WidgetEffect::Mute => widget.mute().await,
        WidgetEffect::Unmute => widget.un_mute().await,
    }
}

/// Read, transform and write a room's state under its lock, outside the
/// command log. Used by the player for its own transitions.
pub(crate) async fn update_state<F>(
    store: &dyn RealtimeStore,
    locks: &RoomLocks,
    code: &RoomCode,
    f: F,
) -> Result<CastState>
where
    F: FnOnce(&CastState) -> Option<CastState> + Send,
{
    let _guard = locks.lock(code).await;
    let current = store.read_state(code).await?;
    match f(&current) {
        Some(next) if next != current => {
            store.write_state(code, next.clone()).await?;
            Ok(next)
        }
        _ => Ok(current),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CatalogItem, Origin, RoomMeta, VideoRequest};
    use crate::store::MemoryStore;
    use crate::widget::{RecordingWidget, WidgetCall};
    use tokio::time::timeout;

    struct Fixture {
        store: MemoryStore,
        widget: Arc<RecordingWidget>,
        executor: Arc<CommandExecutor>,
        channel: CommandChannel,
        code: RoomCode,
    }

    async fn fixture() -> Fixture {
        fixture_with(ExecutorConfig::default()).await
    }

    async fn fixture_with(config: ExecutorConfig) -> Fixture {
        let store = MemoryStore::default();
        let code = RoomCode::parse("0042").unwrap();
        store
            .create_room(RoomMeta::new(code.clone(), "player", 0), CastState::default())
            .await
            .unwrap();
        let widget = Arc::new(RecordingWidget::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::new(store.clone()),
            widget.clone(),
            RoomLocks::new(),
            config,
        ));
        let channel = CommandChannel::new(Arc::new(store.clone()));
        Fixture { store, widget, executor, channel, code }
    }

    fn add(id: &str) -> Command {
        Command::AddToQueue(VideoRequest::new(CatalogItem::new(id, id)))
    }

    async fn send(f: &Fixture, cmd: Command) -> CommandEnvelope {
        f.channel.send_command(&f.code, cmd, Origin::Controller).await.unwrap()
    }

    async fn wait_terminal(f: &Fixture, count: usize) -> Vec<CommandEnvelope> {
        timeout(Duration::from_secs(2), async {
            loop {
                let log = f.store.commands(&f.code).await.unwrap();
                if log.iter().filter(|e| e.status.is_terminal()).count() >= count {
                    return log;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("commands did not finish")
    }

    #[tokio::test]
    async fn test_execute_applies_and_completes() {
        let f = fixture().await;
        let env = send(&f, add("a")).await;
        let outcome = f.executor.execute(&f.code, &env).await.unwrap();
        assert_eq!(outcome.status, CommandStatus::Completed);
        let state = f.store.read_state(&f.code).await.unwrap();
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.current_video.unwrap().video_id, "a");
        let log = f.store.commands(&f.code).await.unwrap();
        assert_eq!(log[0].status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_queue_commands_do_not_touch_widget() {
        let f = fixture().await;
        for cmd in [add("a"), add("b"), Command::Next, Command::MoveUp(1), Command::ClearQueue] {
            let env = send(&f, cmd).await;
            f.executor.execute(&f.code, &env).await.unwrap();
        }
        assert!(f.widget.calls().is_empty());
    }

    #[tokio::test]
    async fn test_control_commands_drive_widget() {
        let f = fixture().await;
        for cmd in [Command::Play, Command::Pause, Command::Unmute, Command::Mute, Command::ToggleMute] {
            let env = send(&f, cmd).await;
            f.executor.execute(&f.code, &env).await.unwrap();
        }
        assert_eq!(
            f.widget.calls(),
            vec![WidgetCall::Play, WidgetCall::Pause, WidgetCall::UnMute, WidgetCall::Mute, WidgetCall::UnMute]
        );
        let state = f.store.read_state(&f.code).await.unwrap();
        assert!(!state.controls.is_muted);
        assert!(!state.controls.is_playing);
    }

    #[tokio::test]
    async fn test_widget_failure_marks_failed_and_keeps_state() {
        let f = fixture().await;
        f.widget.fail_on(WidgetCall::Play);
        let env = send(&f, Command::Play).await;
        let outcome = f.executor.execute(&f.code, &env).await.unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("widget"));
        let log = f.store.commands(&f.code).await.unwrap();
        assert_eq!(log[0].status, CommandStatus::Failed);
        assert!(log[0].error.is_some());
        // State was persisted before the widget call.
        assert!(f.store.read_state(&f.code).await.unwrap().controls.is_playing);
    }

    #[tokio::test]
    async fn test_execute_refuses_already_claimed_envelope() {
        let f = fixture().await;
        let env = send(&f, add("a")).await;
        f.executor.execute(&f.code, &env).await.unwrap();
        let err = f.executor.execute(&f.code, &env).await.unwrap_err();
        assert!(matches!(err, CastError::InvalidTransition { .. }));
        assert_eq!(f.store.read_state(&f.code).await.unwrap().queue.len(), 1);
    }

    #[tokio::test]
    async fn test_run_processes_backlog_and_live_commands() {
        let f = fixture().await;
        send(&f, add("a")).await;
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        send(&f, add("b")).await;
        send(&f, Command::Next).await;

        wait_terminal(&f, 3).await;
        let state = f.store.read_state(&f.code).await.unwrap();
        assert_eq!(state.current_index, 1);
        assert_eq!(state.current_video.unwrap().video_id, "b");

        f.store.delete_room(&f.code).await.unwrap();
        let processed = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
        assert_eq!(processed, 3);
    }

    #[tokio::test]
    async fn test_run_continues_after_failure() {
        let f = fixture().await;
        f.widget.fail_on(WidgetCall::Pause);
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        send(&f, Command::Pause).await;
        send(&f, add("a")).await;
        let log = wait_terminal(&f, 2).await;
        assert_eq!(log[0].status, CommandStatus::Failed);
        assert_eq!(log[1].status, CommandStatus::Completed);
        handle.abort();
    }

    #[tokio::test]
    async fn test_second_executor_refused_by_lease() {
        let f = fixture().await;
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rival = CommandExecutor::new(
            Arc::new(f.store.clone()),
            Arc::new(RecordingWidget::new()),
            RoomLocks::new(),
            ExecutorConfig::default(),
        );
        let err = rival.run(&f.code).await.unwrap_err();
        assert!(matches!(err, CastError::LeaseHeld { .. }));
        handle.abort();
    }

    #[tokio::test]
    async fn test_executor_stops_when_lease_taken_over() {
        let f = fixture_with(ExecutorConfig {
            lease_ttl: Duration::from_millis(60),
            heartbeat: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(5),
        })
        .await;
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Simulate a takeover after the lease lapsed.
        f.store.release_lease(&f.code, f.executor.owner()).await.unwrap();
        f.store.acquire_lease(&f.code, "intruder", now_ms(), 60_000).await.unwrap();
        let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(CastError::LeaseHeld { .. })));
    }

    fn fast_retry() -> ExecutorConfig {
        ExecutorConfig {
            lease_ttl: Duration::from_millis(200),
            heartbeat: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_executor_survives_store_outage() {
        let f = fixture_with(fast_retry()).await;
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.store.set_online(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished(), "outage stopped the executor");
        f.store.set_online(true);

        send(&f, Command::Play).await;
        let log = wait_terminal(&f, 1).await;
        assert_eq!(log[0].status, CommandStatus::Completed);
        assert!(f.store.read_state(&f.code).await.unwrap().controls.is_playing);
        handle.abort();
    }

    #[tokio::test]
    async fn test_claim_failed_during_outage_runs_before_later_commands() {
        let f = fixture_with(fast_retry()).await;
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let guard = f.executor.locks().lock(&f.code).await;
        let play = send(&f, Command::Play).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.store.set_online(false);
        drop(guard);
        tokio::time::sleep(Duration::from_millis(40)).await;
        f.store.set_online(true);
        let pause = send(&f, Command::Pause).await;

        let log = wait_terminal(&f, 2).await;
        assert_eq!(log[0].id, play.id);
        assert_eq!(log[0].status, CommandStatus::Completed);
        assert_eq!(log[1].id, pause.id);
        assert_eq!(log[1].status, CommandStatus::Completed);
        assert_eq!(f.widget.calls(), vec![WidgetCall::Play, WidgetCall::Pause]);
        assert!(!f.store.read_state(&f.code).await.unwrap().controls.is_playing);
        handle.abort();
    }

    #[tokio::test]
    async fn test_play_then_pause_ends_paused() {
        let f = fixture().await;
        let handle = Arc::clone(&f.executor).spawn(f.code.clone());
        send(&f, Command::Play).await;
        send(&f, Command::Pause).await;
        wait_terminal(&f, 2).await;
        assert!(!f.store.read_state(&f.code).await.unwrap().controls.is_playing);
        assert_eq!(f.widget.calls(), vec![WidgetCall::Play, WidgetCall::Pause]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_room_locks_serialize_holders() {
        let locks = RoomLocks::new();
        let code = RoomCode::parse("0001").unwrap();
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let code = code.clone();
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock(&code).await;
                let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0, "two holders inside the same room lock");
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(locks.len(), 1);
        locks.forget(&code);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_update_state_skips_unchanged_write() {
        let f = fixture().await;
        let (_, mut rx) = f.store.watch_state(&f.code).await.unwrap();
        let locks = RoomLocks::new();
        update_state(&f.store, &locks, &f.code, |_| None).await.unwrap();
        assert!(rx.try_recv().is_err());
        let next = update_state(&f.store, &locks, &f.code, |s| {
            let mut s = s.clone();
            s.controls.is_playing = true;
            Some(s)
        })
        .await
        .unwrap();
        assert!(next.controls.is_playing);
        assert!(rx.try_recv().is_ok());
    }
}
