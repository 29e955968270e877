//! Read-only state subscription and the controller-side facade.
//!
//! Controllers only ever read `CastState` and append commands. Nothing in this
//! module writes state, envelope status or participants.

use futures_util::Stream;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::channel::CommandChannel;
use crate::error::Result;
use crate::model::{CastState, CatalogItem, Command, CommandEnvelope, Identity, Origin, RoomCode, VideoRequest};
use crate::registry::{JoinOutcome, LeaveOutcome, RoomRegistry};
use crate::store::{RealtimeStore, StateEvent};

/// Opens state subscriptions.
#[derive(Clone)]
pub struct StateSync {
    store: Arc<dyn RealtimeStore>,
}

impl StateSync {
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self { store }
    }

    /// Subscribe to a room's snapshots. The current snapshot is available
    /// immediately via [`StateWatch::last_snapshot`].
    pub async fn subscribe(&self, code: &RoomCode) -> Result<StateWatch> {
        let (current, rx) = self.store.watch_state(code).await?;
        Ok(StateWatch {
            code: code.clone(),
            store: Arc::clone(&self.store),
            last: current,
            rx,
            gone: false,
        })
    }
}

/// A live view of one room's state.
pub struct StateWatch {
    code: RoomCode,
    store: Arc<dyn RealtimeStore>,
    last: CastState,
    rx: broadcast::Receiver<StateEvent>,
    gone: bool,
}

impl StateWatch {
    pub fn room(&self) -> &RoomCode {
        &self.code
    }

    /// The most recent snapshot seen.
    pub fn last_snapshot(&self) -> &CastState {
        &self.last
    }

    /// Whether the room has been deleted.
    pub fn is_gone(&self) -> bool {
        self.gone
    }

    /// Wait for the next snapshot. `None` once the room is gone.
    ///
    /// When the subscriber falls behind, intermediate snapshots are skipped
    /// and the latest one is returned.
    pub async fn next(&mut self) -> Option<CastState> {
        if self.gone {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(StateEvent::Snapshot(state)) => {
                    self.last = state.clone();
                    return Some(state);
                }
                Ok(StateEvent::RoomGone) | Err(RecvError::Closed) => {
                    self.gone = true;
                    return None;
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target: "castsync::sync", room = %self.code, skipped, "state watcher lagged");
                    match self.store.read_state(&self.code).await {
                        Ok(state) => {
                            self.last = state.clone();
                            return Some(state);
                        }
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = CastState> + Send {
        futures_util::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|state| (state, watch))
        })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The controller end of a room: sends commands and reads state.
pub struct Controller {
    identity: Identity,
    code: RoomCode,
    is_host: bool,
    registry: RoomRegistry,
    channel: CommandChannel,
    sync: StateSync,
}

impl Controller {
    /// Join `code` as `identity`.
    pub async fn join(store: Arc<dyn RealtimeStore>, code: RoomCode, identity: Identity) -> Result<Self> {
        let registry = RoomRegistry::new(Arc::clone(&store));
        let JoinOutcome { is_host } = registry.join_room(&code, &identity).await?;
        Ok(Self {
            identity,
            code,
            is_host,
            registry,
            channel: CommandChannel::new(Arc::clone(&store)),
            sync: StateSync::new(store),
        })
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub async fn subscribe(&self) -> Result<StateWatch> {
        self.sync.subscribe(&self.code).await
    }

    pub async fn send(&self, command: Command) -> Result<CommandEnvelope> {
        self.channel.send_command(&self.code, command, Origin::Controller).await
    }

    fn request(&self, video: CatalogItem) -> VideoRequest {
        VideoRequest { video, added_by: Some(self.identity.id.clone()) }
    }

    pub async fn play_now(&self, video: CatalogItem) -> Result<CommandEnvelope> {
        self.send(Command::PlayNow(self.request(video))).await
    }

    pub async fn add_to_queue(&self, video: CatalogItem) -> Result<CommandEnvelope> {
        self.send(Command::AddToQueue(self.request(video))).await
    }

    pub async fn play_next(&self, video: CatalogItem) -> Result<CommandEnvelope> {
        self.send(Command::PlayNext(self.request(video))).await
    }

    pub async fn play(&self) -> Result<CommandEnvelope> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<CommandEnvelope> {
        self.send(Command::Pause).await
    }

    pub async fn next(&self) -> Result<CommandEnvelope> {
        self.send(Command::Next).await
    }

    pub async fn previous(&self) -> Result<CommandEnvelope> {
        self.send(Command::Previous).await
    }

    pub async fn skip_to(&self, index: usize) -> Result<CommandEnvelope> {
        self.send(Command::SkipTo(index)).await
    }

    pub async fn mute(&self) -> Result<CommandEnvelope> {
        self.send(Command::Mute).await
    }

    pub async fn unmute(&self) -> Result<CommandEnvelope> {
        self.send(Command::Unmute).await
    }

    pub async fn toggle_mute(&self) -> Result<CommandEnvelope> {
        self.send(Command::ToggleMute).await
    }

    pub async fn move_up(&self, index: usize) -> Result<CommandEnvelope> {
        self.send(Command::MoveUp(index)).await
    }

    pub async fn move_down(&self, index: usize) -> Result<CommandEnvelope> {
        self.send(Command::MoveDown(index)).await
    }

    pub async fn remove_at(&self, index: usize) -> Result<CommandEnvelope> {
        self.send(Command::RemoveAt(index)).await
    }

    pub async fn clear_queue(&self) -> Result<CommandEnvelope> {
        self.send(Command::ClearQueue).await
    }

    pub async fn set_playlist(&self, playlist: Vec<CatalogItem>) -> Result<CommandEnvelope> {
        self.send(Command::SetPlaylist(playlist)).await
    }

    /// Leave the room. A host leaving deletes it.
    pub async fn leave(self) -> Result<LeaveOutcome> {
        self.registry.leave_room(&self.code, &self.identity).await
    }
}
