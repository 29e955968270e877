//! # Stage: Queue/Playback State Machine
//!
//! ## Responsibility
//! Map `(current CastState, Command)` to the next `CastState`, plus the
//! playback-widget effect a control command requires.
//!
//! ## Guarantees
//! - Pure: no I/O, no clock reads. Insertion keys come from a caller-supplied
//!   [`KeyMint`].
//! - Index invariant preserved: starting from a consistent state, every
//!   transition yields a consistent state (see [`CastState::is_consistent`]).
//! - Out-of-range indices are silent no-ops.
//!
//! ## NOT Responsible For
//! - Persisting the result or calling the widget (that is the executor)
//! - Loading videos when `currentVideo` changes (that is the playback driver)

use crate::model::{CastState, CatalogItem, Command, QueueItem, VideoRequest};

/// Side effect a control command asks of the playback widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetEffect {
    Play,
    Pause,
    Mute,
    Unmute,
}

/// Result of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: CastState,
    pub effect: Option<WidgetEffect>,
}

impl Transition {
    fn state_only(state: CastState) -> Self {
        Self { state, effect: None }
    }
}

/// Source of strictly increasing insertion keys.
#[derive(Debug, Clone)]
pub struct KeyMint {
    next: u64,
}

impl KeyMint {
    /// Start above every key already in `state` and no lower than `floor`
    /// (normally the current epoch milliseconds).
    pub fn after(state: &CastState, floor: u64) -> Self {
        let above_existing = state.max_key().map_or(0, |k| k.saturating_add(1));
        Self { next: above_existing.max(floor) }
    }

    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn mint(&mut self) -> u64 {
        let key = self.next;
        self.next = self.next.saturating_add(1);
        key
    }
}

/// Apply `command` to `state`.
pub fn apply(state: &CastState, command: &Command, keys: &mut KeyMint) -> Transition {
    let mut next = state.clone();
    match command {
        Command::PlayNow(req) => {
            play_now(&mut next, req, keys);
            Transition::state_only(next)
        }
        Command::AddToQueue(req) => {
            let item = new_item(req, keys);
            let was_empty = next.queue.is_empty();
            next.queue.push(item.clone());
            if was_empty {
                next.current_index = 0;
                next.current_video = Some(item);
            }
            Transition::state_only(next)
        }
        Command::PlayNext(req) => {
            let item = new_item(req, keys);
            if next.queue.is_empty() {
                next.queue.push(item.clone());
                next.current_index = 0;
                next.current_video = Some(item);
            } else {
                next.queue.insert(next.current_index + 1, item);
            }
            Transition::state_only(next)
        }
        Command::Play => {
            next.controls.is_playing = true;
            Transition { state: next, effect: Some(WidgetEffect::Play) }
        }
        Command::Pause => {
            next.controls.is_playing = false;
            Transition { state: next, effect: Some(WidgetEffect::Pause) }
        }
        Command::Next => {
            let target = next.current_index.checked_add(1);
            jump(&mut next, target);
            Transition::state_only(next)
        }
        Command::Previous => {
            let target = next.current_index.checked_sub(1);
            jump(&mut next, target);
            Transition::state_only(next)
        }
        Command::SkipTo(index) => {
            jump(&mut next, Some(*index));
            Transition::state_only(next)
        }
        Command::Mute => set_muted(next, true),
        Command::Unmute => set_muted(next, false),
        Command::ToggleMute => {
            let muted = !next.controls.is_muted;
            set_muted(next, muted)
        }
        Command::RemoveAt(index) => {
            remove_at(&mut next, *index);
            Transition::state_only(next)
        }
        Command::MoveUp(index) => {
            if *index > 0 {
                swap_adjacent(&mut next, *index - 1);
            }
            Transition::state_only(next)
        }
        Command::MoveDown(index) => {
            swap_adjacent(&mut next, *index);
            Transition::state_only(next)
        }
        Command::ClearQueue => {
            next.queue.clear();
            next.current_index = 0;
            next.current_video = None;
            next.controls.is_playing = false;
            Transition::state_only(next)
        }
        Command::SetPlaylist(list) => {
            set_playlist(&mut next, list, keys);
            Transition::state_only(next)
        }
    }
}

fn new_item(req: &VideoRequest, keys: &mut KeyMint) -> QueueItem {
    QueueItem::from_catalog(&req.video, keys.mint(), req.added_by.clone())
}

fn play_now(state: &mut CastState, req: &VideoRequest, keys: &mut KeyMint) {
    let requested = &req.video.video_id;

    let is_current = state
        .current_video
        .as_ref()
        .is_some_and(|v| &v.video_id == requested);
    if is_current {
        // Restart in place: only the current pointer gets a fresh key, which
        // makes the player reload while the queue stays as it was.
        if let Some(current) = state.current_video.as_mut() {
            current.key = keys.mint();
        }
        state.controls.is_playing = true;
        return;
    }

    if let Some(pos) = state.position_of(requested) {
        state.current_index = pos;
        state.current_video = Some(state.queue[pos].clone());
        state.controls.is_playing = true;
        return;
    }

    let item = new_item(req, keys);
    state.queue.insert(0, item.clone());
    state.current_index = 0;
    state.current_video = Some(item);
    state.controls.is_playing = true;
}

/// Move to `target` if it is in bounds; otherwise leave the state untouched.
fn jump(state: &mut CastState, target: Option<usize>) {
    let Some(target) = target else { return };
    let Some(item) = state.queue.get(target) else { return };
    state.current_video = Some(item.clone());
    state.current_index = target;
    state.controls.is_playing = true;
}

fn set_muted(mut state: CastState, muted: bool) -> Transition {
    state.controls.is_muted = muted;
    let effect = if muted { WidgetEffect::Mute } else { WidgetEffect::Unmute };
    Transition { state, effect: Some(effect) }
}

fn remove_at(state: &mut CastState, index: usize) {
    if index >= state.queue.len() {
        return;
    }
    state.queue.remove(index);

    if state.queue.is_empty() {
        state.current_index = 0;
        state.current_video = None;
        state.controls.is_playing = false;
        return;
    }

    if index < state.current_index {
        state.current_index -= 1;
    } else if index == state.current_index {
        state.current_index = state.current_index.min(state.queue.len() - 1);
        state.current_video = Some(state.queue[state.current_index].clone());
    }
}

/// Swap entries `upper` and `upper + 1`; the current pointer follows its item.
fn swap_adjacent(state: &mut CastState, upper: usize) {
    let lower = upper + 1;
    if lower >= state.queue.len() {
        return;
    }
    state.queue.swap(upper, lower);
    if state.current_index == upper {
        state.current_index = lower;
    } else if state.current_index == lower {
        state.current_index = upper;
    }
}

fn set_playlist(state: &mut CastState, list: &[CatalogItem], keys: &mut KeyMint) {
    let current = state.current_video.take();
    let kept = current
        .as_ref()
        .and_then(|cur| list.iter().position(|c| c.video_id == cur.video_id));

    let queue: Vec<QueueItem> = list
        .iter()
        .enumerate()
        .map(|(i, item)| match (kept, current.as_ref()) {
            // The still-current entry keeps its key so it is not reloaded.
            (Some(pos), Some(cur)) if pos == i => QueueItem {
                key: cur.key,
                added_by: cur.added_by.clone(),
                ..QueueItem::from_catalog(item, 0, None)
            },
            _ => QueueItem::from_catalog(item, keys.mint(), None),
        })
        .collect();

    let index = kept.unwrap_or(0);
    state.current_video = queue.get(index).cloned();
    state.current_index = if queue.is_empty() { 0 } else { index };
    if queue.is_empty() {
        state.controls.is_playing = false;
    }
    state.queue = queue;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
