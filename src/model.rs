//! Shared data model: queue items, the replicated cast state, command
//! envelopes and room metadata.
//!
//! All wire types serialize to camelCase JSON so that a controller written in
//! any language can read the store directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CastError, Result};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Identity and catalog collaborators
// ---------------------------------------------------------------------------

/// A stable user or guest identity supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), display_name: display_name.into() }
    }

    /// Mint an anonymous guest identity.
    pub fn guest() -> Self {
        let id = format!("guest-{}", uuid::Uuid::new_v4());
        Self { id, display_name: "Guest".to_string() }
    }
}

/// A playable item as returned by the video catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub video_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl CatalogItem {
    pub fn new(video_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self { video_id: video_id.into(), title: title.into(), author: None }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Queue and cast state
// ---------------------------------------------------------------------------

/// One entry of a room's queue.
///
/// `key` is an insertion token minted by the executor. Two enqueues of the same
/// video carry different keys, and a changed key on `currentVideo` is what tells
/// the player to (re)load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub video_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub key: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
}

impl QueueItem {
    pub fn from_catalog(item: &CatalogItem, key: u64, added_by: Option<String>) -> Self {
        Self {
            video_id: item.video_id.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            key,
            added_by,
        }
    }
}

/// Playback controls mirrored from the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controls {
    pub is_playing: bool,
    pub is_muted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Default for Controls {
    /// A fresh room starts paused and muted.
    fn default() -> Self {
        Self {
            is_playing: false,
            is_muted: true,
            volume: None,
            current_time: None,
            duration: None,
        }
    }
}

/// The authoritative, replicated snapshot of a room's queue and controls.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastState {
    pub queue: Vec<QueueItem>,
    pub current_index: usize,
    pub current_video: Option<QueueItem>,
    pub controls: Controls,
}

impl CastState {
    /// Index of the first queue entry carrying `video_id`.
    pub fn position_of(&self, video_id: &str) -> Option<usize> {
        self.queue.iter().position(|item| item.video_id == video_id)
    }

    /// Highest insertion key present in the queue or on `currentVideo`.
    pub fn max_key(&self) -> Option<u64> {
        self.queue
            .iter()
            .map(|item| item.key)
            .chain(self.current_video.as_ref().map(|v| v.key))
            .max()
    }

    /// Check the index invariants:
    /// a non-empty queue has `current_index` in bounds, an empty one has
    /// `current_index == 0` and no current video.
    pub fn is_consistent(&self) -> bool {
        if self.queue.is_empty() {
            self.current_index == 0 && self.current_video.is_none()
        } else {
            self.current_index < self.queue.len()
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A video carried by an enqueue-style command. The key is minted by the
/// executor, not by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRequest {
    pub video: CatalogItem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
}

impl VideoRequest {
    pub fn new(video: CatalogItem) -> Self {
        Self { video, added_by: None }
    }

    pub fn added_by(mut self, who: impl Into<String>) -> Self {
        self.added_by = Some(who.into());
        self
    }
}

/// Operations a controller can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireCommand", try_from = "WireCommand")]
pub enum Command {
    PlayNow(VideoRequest),
    AddToQueue(VideoRequest),
    PlayNext(VideoRequest),
    Play,
    Pause,
    Next,
    Previous,
    SkipTo(usize),
    Mute,
    Unmute,
    ToggleMute,
    RemoveAt(usize),
    MoveUp(usize),
    MoveDown(usize),
    ClearQueue,
    SetPlaylist(Vec<CatalogItem>),
}

impl Command {
    /// Wire name of the operation.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::PlayNow(_) => "PLAY_NOW",
            Command::AddToQueue(_) => "ADD_TO_QUEUE",
            Command::PlayNext(_) => "PLAY_NEXT",
            Command::Play => "PLAY",
            Command::Pause => "PAUSE",
            Command::Next => "NEXT",
            Command::Previous => "PREVIOUS",
            Command::SkipTo(_) => "SKIP_TO",
            Command::Mute => "MUTE",
            Command::Unmute => "UNMUTE",
            Command::ToggleMute => "TOGGLE_MUTE",
            Command::RemoveAt(_) => "REMOVE_AT",
            Command::MoveUp(_) => "MOVE_UP",
            Command::MoveDown(_) => "MOVE_DOWN",
            Command::ClearQueue => "CLEAR_QUEUE",
            Command::SetPlaylist(_) => "SET_PLAYLIST",
        }
    }

    /// Commands that drive the playback widget directly.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Command::Play | Command::Pause | Command::Mute | Command::Unmute | Command::ToggleMute
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Serialize, Deserialize)]
struct IndexPayload {
    index: usize,
}

#[derive(Serialize, Deserialize)]
struct PlaylistPayload {
    playlist: Vec<CatalogItem>,
}

/// `{type, payload}` shape of a command on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireCommand {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

impl From<Command> for WireCommand {
    fn from(cmd: Command) -> Self {
        let kind = cmd.kind().to_string();
        let payload = match cmd {
            Command::PlayNow(req) | Command::AddToQueue(req) | Command::PlayNext(req) => {
                serde_json::to_value(req).ok()
            }
            Command::SkipTo(index)
            | Command::RemoveAt(index)
            | Command::MoveUp(index)
            | Command::MoveDown(index) => serde_json::to_value(IndexPayload { index }).ok(),
            Command::SetPlaylist(playlist) => {
                serde_json::to_value(PlaylistPayload { playlist }).ok()
            }
            _ => None,
        };
        WireCommand { kind, payload }
    }
}

impl TryFrom<WireCommand> for Command {
    type Error = String;

    fn try_from(wire: WireCommand) -> std::result::Result<Self, Self::Error> {
        fn body<T: serde::de::DeserializeOwned>(
            kind: &str,
            payload: Option<serde_json::Value>,
        ) -> std::result::Result<T, String> {
            let value = payload.ok_or_else(|| format!("{kind} requires a payload"))?;
            serde_json::from_value(value).map_err(|e| format!("{kind} payload: {e}"))
        }

        let kind = wire.kind.as_str();
        let cmd = match kind {
            "PLAY_NOW" => Command::PlayNow(body(kind, wire.payload)?),
            "ADD_TO_QUEUE" => Command::AddToQueue(body(kind, wire.payload)?),
            "PLAY_NEXT" => Command::PlayNext(body(kind, wire.payload)?),
            "PLAY" => Command::Play,
            "PAUSE" => Command::Pause,
            "NEXT" => Command::Next,
            "PREVIOUS" => Command::Previous,
            "SKIP_TO" => Command::SkipTo(body::<IndexPayload>(kind, wire.payload)?.index),
            "MUTE" => Command::Mute,
            "UNMUTE" => Command::Unmute,
            "TOGGLE_MUTE" => Command::ToggleMute,
            "REMOVE_AT" => Command::RemoveAt(body::<IndexPayload>(kind, wire.payload)?.index),
            "MOVE_UP" => Command::MoveUp(body::<IndexPayload>(kind, wire.payload)?.index),
            "MOVE_DOWN" => Command::MoveDown(body::<IndexPayload>(kind, wire.payload)?.index),
            "CLEAR_QUEUE" => Command::ClearQueue,
            "SET_PLAYLIST" => {
                Command::SetPlaylist(body::<PlaylistPayload>(kind, wire.payload)?.playlist)
            }
            other => return Err(format!("unknown command type '{other}'")),
        };
        Ok(cmd)
    }
}

// ---------------------------------------------------------------------------
// Command envelopes
// ---------------------------------------------------------------------------

/// Processing status of a command envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// Status only moves forward: pending → executing → completed | failed.
    pub fn can_advance_to(self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Pending, CommandStatus::Executing)
                | (CommandStatus::Executing, CommandStatus::Completed)
                | (CommandStatus::Executing, CommandStatus::Failed)
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which end of the room produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Controller,
    Player,
}

/// The wire unit carrying one requested operation plus its processing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub command: Command,
    pub status: CommandStatus,
    pub timestamp: u64,
    #[serde(rename = "from")]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandEnvelope {
    /// A fresh pending envelope with a unique id.
    pub fn pending(command: Command, origin: Origin, timestamp: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
            status: CommandStatus::Pending,
            timestamp,
            origin,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// A validated four-digit room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Number of distinct codes.
    pub const SPACE: u32 = 10_000;

    /// Accept exactly four ASCII digits.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() == 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CastError::InvalidRoomCode(raw.to_string()))
        }
    }

    /// Uniform draw over `[0, 10000)`, zero-padded.
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        Self(format!("{:04}", rng.gen_range(0..Self::SPACE)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = CastError;

    fn try_from(raw: String) -> Result<Self> {
        RoomCode::parse(&raw)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Membership record of a room: host and participants (identity → joinedAt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMeta {
    pub code: RoomCode,
    pub host_id: String,
    pub created_at: u64,
    pub participants: BTreeMap<String, u64>,
}

impl RoomMeta {
    pub fn new(code: RoomCode, host_id: impl Into<String>, created_at: u64) -> Self {
        let host_id = host_id.into();
        let mut participants = BTreeMap::new();
        participants.insert(host_id.clone(), created_at);
        Self { code, host_id, created_at, participants }
    }
}

/// A full read of one room: membership, state and command log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(flatten)]
    pub meta: RoomMeta,
    pub state: CastState,
    pub commands: Vec<CommandEnvelope>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
