//! The embedded playback widget the player drives.
//!
//! The widget is an external collaborator; this module only fixes the calls
//! the executor and the playback driver make on it and the events it emits.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

use crate::error::{CastError, Result};

/// Widget-reported player state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

impl PlayerState {
    /// Map the widget's numeric state code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(PlayerState::Unstarted),
            0 => Some(PlayerState::Ended),
            1 => Some(PlayerState::Playing),
            2 => Some(PlayerState::Paused),
            3 => Some(PlayerState::Buffering),
            5 => Some(PlayerState::Cued),
            _ => None,
        }
    }
}

/// Events emitted by the widget.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetEvent {
    Ready,
    StateChange(PlayerState),
    Error(String),
    /// Media reached its end.
    Ended,
}

/// Calls the player makes on the embedded widget.
#[async_trait]
pub trait PlaybackWidget: Send + Sync {
    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn mute(&self) -> Result<()>;
    async fn un_mute(&self) -> Result<()>;
    /// Load and start playing.
    async fn load_video_by_id(&self, video_id: &str) -> Result<()>;
    /// Load without playing.
    async fn cue_video_by_id(&self, video_id: &str) -> Result<()>;
    async fn get_player_state(&self) -> Result<PlayerState>;
    /// Seconds into the current video.
    async fn get_current_time(&self) -> Result<f64>;
    /// Length of the current video in seconds.
    async fn get_duration(&self) -> Result<f64>;
}

/// A widget that only logs what it is asked to do. Used by the demo binary.
#[derive(Debug)]
pub struct LoggingWidget {
    state: Mutex<PlayerState>,
}

impl Default for LoggingWidget {
    fn default() -> Self {
        Self { state: Mutex::new(PlayerState::Unstarted) }
    }
}

impl LoggingWidget {
    fn set(&self, state: PlayerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }
}

#[async_trait]
impl PlaybackWidget for LoggingWidget {
    async fn play(&self) -> Result<()> {
        info!(target: "castsync::widget", "play");
        self.set(PlayerState::Playing);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        info!(target: "castsync::widget", "pause");
        self.set(PlayerState::Paused);
        Ok(())
    }

    async fn mute(&self) -> Result<()> {
        info!(target: "castsync::widget", "mute");
        Ok(())
    }

    async fn un_mute(&self) -> Result<()> {
        info!(target: "castsync::widget", "unmute");
        Ok(())
    }

    async fn load_video_by_id(&self, video_id: &str) -> Result<()> {
        info!(target: "castsync::widget", video_id, "load");
        self.set(PlayerState::Playing);
        Ok(())
    }

    async fn cue_video_by_id(&self, video_id: &str) -> Result<()> {
        info!(target: "castsync::widget", video_id, "cue");
        self.set(PlayerState::Cued);
        Ok(())
    }

    async fn get_player_state(&self) -> Result<PlayerState> {
        Ok(self.state.lock().map(|s| *s).unwrap_or(PlayerState::Unstarted))
    }

    async fn get_current_time(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn get_duration(&self) -> Result<f64> {
        Ok(0.0)
    }
}

/// One call made on a [`RecordingWidget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetCall {
    Play,
    Pause,
    Mute,
    UnMute,
    Load(String),
    Cue(String),
}

/// A widget that records every call, for tests and dry runs.
///
/// `fail_on` makes matching calls return [`CastError::Widget`] (the call is
/// still recorded). Time and duration are settable.
#[derive(Debug, Default)]
pub struct RecordingWidget {
    calls: Mutex<Vec<WidgetCall>>,
    failing: Mutex<Vec<WidgetCall>>,
    position: Mutex<(f64, f64)>,
}

impl RecordingWidget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<WidgetCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn fail_on(&self, call: WidgetCall) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(call);
        }
    }

    pub fn set_position(&self, current_time: f64, duration: f64) {
        if let Ok(mut pos) = self.position.lock() {
            *pos = (current_time, duration);
        }
    }

    fn record(&self, call: WidgetCall) -> Result<()> {
        let fails = self
            .failing
            .lock()
            .map(|f| f.contains(&call))
            .unwrap_or(false);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
        if fails {
            return Err(CastError::Widget(format!("{call:?} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybackWidget for RecordingWidget {
    async fn play(&self) -> Result<()> {
        self.record(WidgetCall::Play)
    }

    async fn pause(&self) -> Result<()> {
        self.record(WidgetCall::Pause)
    }

    async fn mute(&self) -> Result<()> {
        self.record(WidgetCall::Mute)
    }

    async fn un_mute(&self) -> Result<()> {
        self.record(WidgetCall::UnMute)
    }

    async fn load_video_by_id(&self, video_id: &str) -> Result<()> {
        self.record(WidgetCall::Load(video_id.to_string()))
    }

    async fn cue_video_by_id(&self, video_id: &str) -> Result<()> {
        self.record(WidgetCall::Cue(video_id.to_string()))
    }

    async fn get_player_state(&self) -> Result<PlayerState> {
        let last = self.calls().into_iter().rev().find_map(|c| match c {
            WidgetCall::Play | WidgetCall::Load(_) => Some(PlayerState::Playing),
            WidgetCall::Pause => Some(PlayerState::Paused),
            WidgetCall::Cue(_) => Some(PlayerState::Cued),
            _ => None,
        });
        Ok(last.unwrap_or(PlayerState::Unstarted))
    }

    async fn get_current_time(&self) -> Result<f64> {
        Ok(self.position.lock().map(|p| p.0).unwrap_or(0.0))
    }

    async fn get_duration(&self) -> Result<f64> {
        Ok(self.position.lock().map(|p| p.1).unwrap_or(0.0))
    }
}
