//! Room registry: code generation, join and leave.
//!
//! ## Room lifecycle
//! 1. A host (or a player loading without a code) calls [`RoomRegistry::create_room`]
//!    and receives a four-digit code.
//! 2. Controllers call [`RoomRegistry::join_room`] with that code and learn
//!    whether they are the host.
//! 3. [`RoomRegistry::leave_room`] removes a participant; when the host leaves,
//!    the whole room (state, command log, participants) is deleted and the code
//!    is free again.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CastError, Result};
use crate::model::{now_ms, CastState, Identity, RoomCode, RoomMeta};
use crate::store::RealtimeStore;

/// Default bound on collision retries during room creation.
pub const DEFAULT_MAX_CODE_ATTEMPTS: u32 = 64;

/// Result of joining a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub is_host: bool,
}

/// Result of leaving a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// A non-host participant left; the room lives on.
    Left,
    /// The host left and the room was deleted.
    RoomDeleted,
    /// The room was already gone.
    NotFound,
}

/// Creates, joins and leaves rooms in a [`RealtimeStore`].
#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn RealtimeStore>,
    max_attempts: u32,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self { store, max_attempts: DEFAULT_MAX_CODE_ATTEMPTS }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Create a room hosted by `initiator`.
    ///
    /// Draws codes until one is not live, checking before writing. The room
    /// starts with an empty queue, paused and muted, and the initiator already
    /// registered as a participant.
    pub async fn create_room(&self, initiator: &Identity) -> Result<RoomCode> {
        for attempt in 1..=self.max_attempts {
            let code = RoomCode::random(&mut rand::thread_rng());
            if self.store.room_exists(&code).await? {
                debug!(target: "castsync::registry", room = %code, attempt, "room code collision");
                continue;
            }
            let meta = RoomMeta::new(code.clone(), initiator.id.clone(), now_ms());
            if self.store.create_room(meta, CastState::default()).await? {
                info!(
                    target: "castsync::registry",
                    room = %code,
                    host = %initiator.id,
                    "room created"
                );
                return Ok(code);
            }
            // Lost a race between the check and the write.
            debug!(target: "castsync::registry", room = %code, attempt, "room code taken during create");
        }
        Err(CastError::CodeSpaceExhausted { attempts: self.max_attempts })
    }

    /// Join an existing room. Re-joining refreshes the participant entry.
    pub async fn join_room(&self, code: &RoomCode, identity: &Identity) -> Result<JoinOutcome> {
        let meta = self
            .store
            .meta(code)
            .await?
            .ok_or_else(|| CastError::RoomNotFound(code.to_string()))?;
        self.store.upsert_participant(code, &identity.id, now_ms()).await?;
        let is_host = meta.host_id == identity.id;
        info!(
            target: "castsync::registry",
            room = %code,
            participant = %identity.id,
            is_host,
            "participant joined"
        );
        Ok(JoinOutcome { is_host })
    }

    /// Leave a room; the host leaving deletes it.
    pub async fn leave_room(&self, code: &RoomCode, identity: &Identity) -> Result<LeaveOutcome> {
        let Some(meta) = self.store.meta(code).await? else {
            return Ok(LeaveOutcome::NotFound);
        };
        if meta.host_id == identity.id {
            self.store.delete_room(code).await?;
            info!(target: "castsync::registry", room = %code, "host left, room deleted");
            return Ok(LeaveOutcome::RoomDeleted);
        }
        self.store.remove_participant(code, &identity.id).await?;
        info!(target: "castsync::registry", room = %code, participant = %identity.id, "participant left");
        Ok(LeaveOutcome::Left)
    }

    pub fn store(&self) -> &Arc<dyn RealtimeStore> {
        &self.store
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
