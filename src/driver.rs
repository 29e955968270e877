//! Playback driver: the player-side loop that turns state snapshots into
//! widget calls.
//!
//! It never goes through the command log. It watches the room's state stream,
//! loads or cues the widget whenever `currentVideo.key` changes, advances the
//! queue when the widget reports the end of the media, and writes playback
//! progress back into `controls`.
//!
//! A store outage does not stop it. Failed writes are logged; a missed advance
//! or state re-read is retried every [`RETRY_BACKOFF`] until the store answers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CastError, Result};
use crate::executor::{update_state, RoomLocks};
use crate::machine::{self, KeyMint};
use crate::model::{now_ms, CastState, Command, RoomCode};
use crate::store::{RealtimeStore, StateEvent};
use crate::widget::{PlaybackWidget, PlayerState, WidgetEvent};

/// Progress is only persisted when it moved at least this many seconds.
const PROGRESS_EPSILON_SECS: f64 = 0.5;

/// Pause between retries of a store call that failed during an outage.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// What the widget is currently doing with the room's current video.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Loading(String),
    Playing(String),
    Paused(String),
    Ended,
}

/// A widget call the driver must make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetAction {
    Mute,
    Load(String),
    Cue(String),
}

/// Pure phase bookkeeping. Remembers the key of the last loaded entry so a
/// snapshot carrying the same entry never reloads it.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    phase: PlaybackPhase,
    loaded_key: Option<u64>,
    video_id: Option<String>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &PlaybackPhase {
        &self.phase
    }

    pub fn loaded_key(&self) -> Option<u64> {
        self.loaded_key
    }

    /// Feed a state snapshot; returns the widget calls it requires, in order.
    pub fn observe_state(&mut self, state: &CastState) -> Vec<WidgetAction> {
        let Some(current) = &state.current_video else {
            self.phase = PlaybackPhase::Idle;
            self.loaded_key = None;
            self.video_id = None;
            return Vec::new();
        };
        if self.loaded_key == Some(current.key) {
            return Vec::new();
        }
        self.loaded_key = Some(current.key);
        self.video_id = Some(current.video_id.clone());
        self.phase = PlaybackPhase::Loading(current.video_id.clone());
        let load = if state.controls.is_playing {
            WidgetAction::Load(current.video_id.clone())
        } else {
            WidgetAction::Cue(current.video_id.clone())
        };
        vec![WidgetAction::Mute, load]
    }

    /// Feed a widget event. Returns `true` when the media just ended and the
    /// queue should advance.
    pub fn observe_event(&mut self, event: &WidgetEvent) -> bool {
        let Some(id) = self.video_id.clone() else {
            return false;
        };
        match event {
            WidgetEvent::StateChange(PlayerState::Playing) => {
                self.phase = PlaybackPhase::Playing(id);
                false
            }
            WidgetEvent::StateChange(PlayerState::Paused | PlayerState::Cued) => {
                self.phase = PlaybackPhase::Paused(id);
                false
            }
            WidgetEvent::StateChange(PlayerState::Ended) | WidgetEvent::Ended => {
                if self.phase == PlaybackPhase::Ended {
                    return false;
                }
                self.phase = PlaybackPhase::Ended;
                true
            }
            WidgetEvent::StateChange(_) | WidgetEvent::Ready | WidgetEvent::Error(_) => false,
        }
    }
}

/// Drives the widget for one room from its state stream and widget events.
pub struct PlaybackDriver {
    store: Arc<dyn RealtimeStore>,
    widget: Arc<dyn PlaybackWidget>,
    locks: RoomLocks,
    progress_interval: Option<Duration>,
    retry_backoff: Duration,
}

impl PlaybackDriver {
    pub fn new(store: Arc<dyn RealtimeStore>, widget: Arc<dyn PlaybackWidget>, locks: RoomLocks) -> Self {
        Self { store, widget, locks, progress_interval: None, retry_backoff: RETRY_BACKOFF }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff.max(Duration::from_millis(1));
        self
    }

    /// Persist playback progress every `interval` while playing.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Run until the room is deleted.
    pub async fn run(&self, code: &RoomCode, mut events: mpsc::Receiver<WidgetEvent>) -> Result<()> {
        let (initial, mut snapshots) = self.store.watch_state(code).await?;
        let mut tracker = PhaseTracker::new();
        self.perform(code, tracker.observe_state(&initial)).await;

        let reporting = self.progress_interval.is_some();
        let mut progress = tokio::time::interval(self.progress_interval.unwrap_or(Duration::from_secs(3600)));
        progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        progress.tick().await;
        let mut retry = tokio::time::interval(self.retry_backoff);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events_open = true;
        let mut advance_due = false;
        let mut resync_due = false;

        loop {
            tokio::select! {
                snapshot = snapshots.recv() => match snapshot {
                    Ok(StateEvent::Snapshot(state)) => {
                        resync_due = false;
                        self.perform(code, tracker.observe_state(&state)).await;
                    }
                    Ok(StateEvent::RoomGone) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(target: "castsync::driver", room = %code, skipped, "state stream lagged");
                        resync_due = !self.resync(code, &mut tracker).await?;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(WidgetEvent::Error(message)) => {
                        warn!(target: "castsync::driver", room = %code, %message, "widget error");
                    }
                    Some(event) => {
                        if tracker.observe_event(&event) {
                            advance_due = tolerate(code, "advance", self.advance(code).await)?.is_none();
                        }
                    }
                    None => events_open = false,
                },
                _ = progress.tick(), if reporting => {
                    if matches!(tracker.phase(), PlaybackPhase::Playing(_)) {
                        tolerate(code, "progress report", self.report_progress(code).await)?;
                    }
                }
                _ = retry.tick(), if advance_due || resync_due => {
                    if advance_due {
                        advance_due = tolerate(code, "advance", self.advance(code).await)?.is_none();
                    }
                    if resync_due {
                        resync_due = !self.resync(code, &mut tracker).await?;
                    }
                }
            }
        }
        info!(target: "castsync::driver", room = %code, "room gone, driver stopped");
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, code: RoomCode, events: mpsc::Receiver<WidgetEvent>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(&code, events).await })
    }

    /// Re-read the state after a lag. `Ok(false)` means the store was
    /// unavailable and the re-read must be retried.
    async fn resync(&self, code: &RoomCode, tracker: &mut PhaseTracker) -> Result<bool> {
        match tolerate(code, "state re-read", self.store.read_state(code).await)? {
            Some(state) => {
                self.perform(code, tracker.observe_state(&state)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn perform(&self, code: &RoomCode, actions: Vec<WidgetAction>) {
        for action in actions {
            let outcome = match &action {
                WidgetAction::Mute => self.widget.mute().await,
                WidgetAction::Load(id) => self.widget.load_video_by_id(id).await,
                WidgetAction::Cue(id) => self.widget.cue_video_by_id(id).await,
            };
            match outcome {
                Ok(()) => debug!(target: "castsync::driver", room = %code, ?action, "widget action"),
                Err(err) => warn!(target: "castsync::driver", room = %code, ?action, error = %err, "widget action failed"),
            }
        }
    }

    /// Implicit NEXT: advance past the ended entry, or stop at the end.
    async fn advance(&self, code: &RoomCode) -> Result<()> {
        let next = update_state(self.store.as_ref(), &self.locks, code, |state| {
            let mut keys = KeyMint::after(state, now_ms());
            let mut next = machine::apply(state, &Command::Next, &mut keys).state;
            if next.current_index == state.current_index {
                next.controls.is_playing = false;
            }
            Some(next)
        })
        .await?;
        info!(
            target: "castsync::driver",
            room = %code,
            index = next.current_index,
            playing = next.controls.is_playing,
            "media ended"
        );
        Ok(())
    }

    async fn report_progress(&self, code: &RoomCode) -> Result<()> {
        let (time, duration) = match (self.widget.get_current_time().await, self.widget.get_duration().await) {
            (Ok(t), Ok(d)) => (t, d),
            (Err(err), _) | (_, Err(err)) => {
                debug!(target: "castsync::driver", room = %code, error = %err, "progress unavailable");
                return Ok(());
            }
        };
        update_state(self.store.as_ref(), &self.locks, code, |state| {
            let moved = |old: Option<f64>, new: f64| old.map_or(true, |o| (o - new).abs() >= PROGRESS_EPSILON_SECS);
            if !moved(state.controls.current_time, time) && !moved(state.controls.duration, duration) {
                return None;
            }
            let mut next = state.clone();
            next.controls.current_time = Some(time);
            next.controls.duration = Some(duration);
            Some(next)
        })
        .await?;
        Ok(())
    }
}

/// `Ok(None)` for failures the loop outlives: the store is unreachable, or the
/// room vanished and its `RoomGone` event is about to end the loop.
fn tolerate<T>(code: &RoomCode, what: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(CastError::StoreUnavailable(reason)) => {
            warn!(target: "castsync::driver", room = %code, %reason, "{what} failed, store unavailable");
            Ok(None)
        }
        Err(CastError::RoomNotFound(_)) => {
            debug!(target: "castsync::driver", room = %code, "{what} skipped, room gone");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QueueItem, RoomMeta};
    use crate::store::MemoryStore;
    use crate::widget::{RecordingWidget, WidgetCall};
    use tokio::time::timeout;

    fn item(id: &str, key: u64) -> QueueItem {
        QueueItem {
            video_id: id.to_string(),
            title: id.to_uppercase(),
            author: None,
            key,
            added_by: None,
        }
    }

    fn state_at(queue: Vec<QueueItem>, index: usize, playing: bool) -> CastState {
        let mut state = CastState::default();
        state.current_video = queue.get(index).cloned();
        state.queue = queue;
        state.current_index = index;
        state.controls.is_playing = playing;
        state
    }

    #[test]
    fn test_new_key_while_playing_mutes_then_loads() {
        let mut t = PhaseTracker::new();
        let actions = t.observe_state(&state_at(vec![item("a", 1)], 0, true));
        assert_eq!(actions, vec![WidgetAction::Mute, WidgetAction::Load("a".into())]);
        assert_eq!(t.phase(), &PlaybackPhase::Loading("a".into()));
        assert_eq!(t.loaded_key(), Some(1));
    }

    #[test]
    fn test_new_key_while_paused_cues() {
        let mut t = PhaseTracker::new();
        let actions = t.observe_state(&state_at(vec![item("a", 1)], 0, false));
        assert_eq!(actions, vec![WidgetAction::Mute, WidgetAction::Cue("a".into())]);
    }

    #[test]
    fn test_same_key_never_reloads() {
        let mut t = PhaseTracker::new();
        let s = state_at(vec![item("a", 1)], 0, true);
        t.observe_state(&s);
        let mut paused = s.clone();
        paused.controls.is_playing = false;
        assert!(t.observe_state(&s).is_empty());
        assert!(t.observe_state(&paused).is_empty());
    }

    #[test]
    fn test_restart_in_place_reloads_same_video() {
        let mut t = PhaseTracker::new();
        t.observe_state(&state_at(vec![item("a", 1)], 0, true));
        let mut restarted = state_at(vec![item("a", 1)], 0, true);
        restarted.current_video = Some(item("a", 9));
        assert_eq!(
            t.observe_state(&restarted),
            vec![WidgetAction::Mute, WidgetAction::Load("a".into())]
        );
    }

    #[test]
    fn test_empty_state_goes_idle() {
        let mut t = PhaseTracker::new();
        t.observe_state(&state_at(vec![item("a", 1)], 0, true));
        assert!(t.observe_state(&CastState::default()).is_empty());
        assert_eq!(t.phase(), &PlaybackPhase::Idle);
        assert_eq!(t.loaded_key(), None);
    }

    #[test]
    fn test_events_move_phase_and_end_fires_once() {
        let mut t = PhaseTracker::new();
        assert!(!t.observe_event(&WidgetEvent::Ended), "no video, nothing to advance");
        t.observe_state(&state_at(vec![item("a", 1)], 0, true));
        assert!(!t.observe_event(&WidgetEvent::StateChange(PlayerState::Playing)));
        assert_eq!(t.phase(), &PlaybackPhase::Playing("a".into()));
        assert!(!t.observe_event(&WidgetEvent::StateChange(PlayerState::Paused)));
        assert_eq!(t.phase(), &PlaybackPhase::Paused("a".into()));
        assert!(t.observe_event(&WidgetEvent::StateChange(PlayerState::Ended)));
        assert!(!t.observe_event(&WidgetEvent::Ended));
        assert_eq!(t.phase(), &PlaybackPhase::Ended);
    }

    struct Fixture {
        store: MemoryStore,
        widget: Arc<RecordingWidget>,
        code: RoomCode,
        events: mpsc::Sender<WidgetEvent>,
        handle: JoinHandle<Result<()>>,
    }

    async fn start(initial: CastState, progress: Duration) -> Fixture {
        let store = MemoryStore::default();
        let code = RoomCode::parse("0777").unwrap();
        store.create_room(RoomMeta::new(code.clone(), "player", 0), initial).await.unwrap();
        let widget = Arc::new(RecordingWidget::new());
        let driver = Arc::new(
            PlaybackDriver::new(Arc::new(store.clone()), widget.clone(), RoomLocks::new())
                .with_progress_interval(progress),
        );
        let (events, rx) = mpsc::channel(16);
        let handle = driver.spawn(code.clone(), rx);
        Fixture { store, widget, code, events, handle }
    }

    async fn wait_for<F: Fn(&[WidgetCall]) -> bool>(widget: &RecordingWidget, f: F) {
        timeout(Duration::from_secs(2), async {
            while !f(&widget.calls()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("widget never reached expected calls");
    }

    async fn wait_state<F: Fn(&CastState) -> bool>(store: &MemoryStore, code: &RoomCode, f: F) -> CastState {
        timeout(Duration::from_secs(2), async {
            loop {
                let s = store.read_state(code).await.unwrap();
                if f(&s) {
                    return s;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state never matched")
    }

    #[tokio::test]
    async fn test_driver_loads_initial_and_changed_video() {
        let f = start(state_at(vec![item("a", 1), item("b", 2)], 0, true), Duration::ZERO).await;
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;

        f.store
            .write_state(&f.code, state_at(vec![item("a", 1), item("b", 2)], 1, false))
            .await
            .unwrap();
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Cue("b".into()))).await;
        assert_eq!(
            f.widget.calls(),
            vec![
                WidgetCall::Mute,
                WidgetCall::Load("a".into()),
                WidgetCall::Mute,
                WidgetCall::Cue("b".into())
            ]
        );
        f.handle.abort();
    }

    #[tokio::test]
    async fn test_media_end_advances_queue() {
        let f = start(state_at(vec![item("a", 1), item("b", 2)], 0, true), Duration::ZERO).await;
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;
        f.events.send(WidgetEvent::Ended).await.unwrap();
        let s = wait_state(&f.store, &f.code, |s| s.current_index == 1).await;
        assert_eq!(s.current_video.unwrap().video_id, "b");
        assert!(s.controls.is_playing);
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("b".into()))).await;
        f.handle.abort();
    }

    #[tokio::test]
    async fn test_media_end_at_queue_end_stops() {
        let f = start(state_at(vec![item("a", 1)], 0, true), Duration::ZERO).await;
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;
        f.events.send(WidgetEvent::StateChange(PlayerState::Ended)).await.unwrap();
        let s = wait_state(&f.store, &f.code, |s| !s.controls.is_playing).await;
        assert_eq!(s.current_index, 0);
        assert_eq!(s.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_is_persisted_while_playing() {
        let f = start(state_at(vec![item("a", 1)], 0, true), Duration::from_millis(10)).await;
        f.widget.set_position(12.0, 240.0);
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;
        f.events.send(WidgetEvent::StateChange(PlayerState::Playing)).await.unwrap();
        let s = wait_state(&f.store, &f.code, |s| s.controls.current_time.is_some()).await;
        assert_eq!(s.controls.current_time, Some(12.0));
        assert_eq!(s.controls.duration, Some(240.0));
        f.handle.abort();
    }

    #[tokio::test]
    async fn test_driver_survives_store_outage() {
        let f = start(state_at(vec![item("a", 1)], 0, true), Duration::from_millis(10)).await;
        f.widget.set_position(3.0, 60.0);
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;
        f.events.send(WidgetEvent::StateChange(PlayerState::Playing)).await.unwrap();

        f.store.set_online(false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!f.handle.is_finished(), "outage stopped the driver");
        f.store.set_online(true);

        f.store
            .write_state(&f.code, state_at(vec![item("a", 1), item("b", 2)], 1, true))
            .await
            .unwrap();
        wait_for(&f.widget, |c| c.contains(&WidgetCall::Load("b".into()))).await;
        f.handle.abort();
    }

    #[tokio::test]
    async fn test_advance_missed_during_outage_is_retried() {
        let store = MemoryStore::default();
        let code = RoomCode::parse("0779").unwrap();
        store
            .create_room(RoomMeta::new(code.clone(), "player", 0), state_at(vec![item("a", 1), item("b", 2)], 0, true))
            .await
            .unwrap();
        let widget = Arc::new(RecordingWidget::new());
        let driver = Arc::new(
            PlaybackDriver::new(Arc::new(store.clone()), widget.clone(), RoomLocks::new())
                .with_retry_backoff(Duration::from_millis(10)),
        );
        let (events, rx) = mpsc::channel(4);
        let handle = driver.spawn(code.clone(), rx);
        wait_for(&widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;

        store.set_online(false);
        events.send(WidgetEvent::Ended).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.set_online(true);

        let s = wait_state(&store, &code, |s| s.current_index == 1).await;
        assert_eq!(s.current_video.unwrap().video_id, "b");
        wait_for(&widget, |c| c.contains(&WidgetCall::Load("b".into()))).await;
        handle.abort();
    }

    #[tokio::test]
    async fn test_driver_stops_when_room_deleted() {
        let f = start(CastState::default(), Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.store.delete_room(&f.code).await.unwrap();
        let result = timeout(Duration::from_secs(1), f.handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(f.widget.calls().is_empty());
    }

    #[tokio::test]
    async fn test_widget_failure_does_not_stop_driver() {
        let store = MemoryStore::default();
        let code = RoomCode::parse("0778").unwrap();
        store
            .create_room(RoomMeta::new(code.clone(), "player", 0), CastState::default())
            .await
            .unwrap();
        let widget = Arc::new(RecordingWidget::new());
        widget.fail_on(WidgetCall::Load("a".into()));
        let driver = Arc::new(PlaybackDriver::new(Arc::new(store.clone()), widget.clone(), RoomLocks::new()));
        let (_tx, rx) = mpsc::channel(4);
        let handle = driver.spawn(code.clone(), rx);

        store.write_state(&code, state_at(vec![item("a", 1)], 0, true)).await.unwrap();
        wait_for(&widget, |c| c.contains(&WidgetCall::Load("a".into()))).await;
        store.write_state(&code, state_at(vec![item("b", 2)], 0, true)).await.unwrap();
        wait_for(&widget, |c| c.contains(&WidgetCall::Load("b".into()))).await;
        handle.abort();
    }
}
