//! # Stage: Real-time Store
//!
//! ## Responsibility
//! The shared document store both ends of a room talk through. Each room is
//! kept as three independently-owned records, each with its own change stream:
//!
//! | Record | Writer | Stream |
//! |---|---|---|
//! | membership ([`RoomMeta`]) | room registry | [`MemberEvent`] |
//! | state ([`CastState`]) | the room's executor | [`StateEvent`] |
//! | command log ([`CommandEnvelope`]s) | controllers append, executor updates status | [`LogEvent`] |
//!
//! plus an executor lease record used to keep a single writer per room.
//!
//! ## Guarantees
//! - State writes replace the whole snapshot; readers never see a partial one.
//! - Envelope status only moves forward (enforced on every status write).
//! - Deleting a room drops all three records at once and emits `RoomGone` on
//!   every stream.
//! - When the store is offline every call fails with `StoreUnavailable` and
//!   nothing is written.
//!
//! ## NOT Responsible For
//! - Ordering between concurrent writers (the executor serializes per room)
//! - Expiring rooms or commands (see `retention`)

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::error::{CastError, Result};
use crate::model::{CastState, CommandEnvelope, CommandStatus, Room, RoomCode, RoomMeta};

/// Default broadcast capacity per room stream.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Change on a room's membership record.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberEvent {
    Changed(RoomMeta),
    RoomGone,
}

/// Change on a room's state record.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Snapshot(CastState),
    RoomGone,
}

/// Change on a room's command log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Added(CommandEnvelope),
    StatusChanged(CommandEnvelope),
    Removed(Vec<String>),
    RoomGone,
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired { expires_at: u64 },
    Held { owner: String, expires_at: u64 },
}

// ---------------------------------------------------------------------------
// RealtimeStore trait
// ---------------------------------------------------------------------------

/// The operations the registry, channel, executor and retention need from a
/// real-time document store.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn room_exists(&self, code: &RoomCode) -> Result<bool>;

    /// Insert a room if the code is free. Returns `false` when the code is
    /// already live.
    async fn create_room(&self, meta: RoomMeta, state: CastState) -> Result<bool>;

    /// Delete membership, state, command log and lease together.
    /// Returns `false` when the room did not exist.
    async fn delete_room(&self, code: &RoomCode) -> Result<bool>;

    async fn rooms(&self) -> Result<Vec<RoomCode>>;

    async fn meta(&self, code: &RoomCode) -> Result<Option<RoomMeta>>;

    /// Insert or refresh a participant entry. `RoomNotFound` if the room is gone.
    async fn upsert_participant(&self, code: &RoomCode, identity: &str, joined_at: u64) -> Result<()>;

    /// Returns whether an entry was removed.
    async fn remove_participant(&self, code: &RoomCode, identity: &str) -> Result<bool>;

    async fn read_state(&self, code: &RoomCode) -> Result<CastState>;

    /// Replace the whole state snapshot in one write.
    async fn write_state(&self, code: &RoomCode, state: CastState) -> Result<()>;

    async fn append_command(&self, code: &RoomCode, envelope: CommandEnvelope) -> Result<()>;

    /// Advance an envelope's status, recording `error` when given.
    async fn set_command_status(
        &self,
        code: &RoomCode,
        id: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<CommandEnvelope>;

    async fn commands(&self, code: &RoomCode) -> Result<Vec<CommandEnvelope>>;

    /// Delete envelopes by id. Returns how many were removed.
    async fn remove_commands(&self, code: &RoomCode, ids: &[String]) -> Result<usize>;

    async fn watch_members(&self, code: &RoomCode)
        -> Result<(RoomMeta, broadcast::Receiver<MemberEvent>)>;

    async fn watch_state(&self, code: &RoomCode)
        -> Result<(CastState, broadcast::Receiver<StateEvent>)>;

    /// Current log contents plus a receiver for changes after that read.
    async fn watch_commands(&self, code: &RoomCode)
        -> Result<(Vec<CommandEnvelope>, broadcast::Receiver<LogEvent>)>;

    /// Compare-and-set on the room's executor lease. Succeeds when the lease
    /// is free, expired at `now`, or already held by `owner`.
    async fn acquire_lease(&self, code: &RoomCode, owner: &str, now: u64, ttl_ms: u64)
        -> Result<LeaseOutcome>;

    /// Drop the lease if `owner` holds it.
    async fn release_lease(&self, code: &RoomCode, owner: &str) -> Result<()>;

    /// Read all three records of a room.
    async fn room(&self, code: &RoomCode) -> Result<Room> {
        let meta = self
            .meta(code)
            .await?
            .ok_or_else(|| CastError::RoomNotFound(code.to_string()))?;
        let state = self.read_state(code).await?;
        let commands = self.commands(code).await?;
        Ok(Room { meta, state, commands })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: u64,
}

struct RoomSlot {
    meta: RoomMeta,
    state: CastState,
    commands: Vec<CommandEnvelope>,
    lease: Option<Lease>,
    members_tx: broadcast::Sender<MemberEvent>,
    state_tx: broadcast::Sender<StateEvent>,
    log_tx: broadcast::Sender<LogEvent>,
}

impl RoomSlot {
    fn new(meta: RoomMeta, state: CastState, capacity: usize) -> Self {
        let (members_tx, _) = broadcast::channel(capacity);
        let (state_tx, _) = broadcast::channel(capacity);
        let (log_tx, _) = broadcast::channel(capacity);
        Self {
            meta,
            state,
            commands: Vec::new(),
            lease: None,
            members_tx,
            state_tx,
            log_tx,
        }
    }
}

struct MemoryInner {
    rooms: Mutex<HashMap<RoomCode, RoomSlot>>,
    online: AtomicBool,
    capacity: usize,
}

/// In-process [`RealtimeStore`].
///
/// Clones share the same rooms. Sending on a broadcast
/// channel with no subscribers is not an error.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                rooms: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                capacity: channel_capacity.max(1),
            }),
        }
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    fn with_rooms<T>(&self, f: impl FnOnce(&mut HashMap<RoomCode, RoomSlot>) -> Result<T>) -> Result<T> {
        if !self.is_online() {
            return Err(CastError::StoreUnavailable("store is offline".to_string()));
        }
        let mut guard = self
            .inner
            .rooms
            .lock()
            .map_err(|_| CastError::StoreUnavailable("internal: lock poisoned".to_string()))?;
        f(&mut guard)
    }

    fn with_room<T>(&self, code: &RoomCode, f: impl FnOnce(&mut RoomSlot) -> Result<T>) -> Result<T> {
        self.with_rooms(|rooms| {
            let slot = rooms
                .get_mut(code)
                .ok_or_else(|| CastError::RoomNotFound(code.to_string()))?;
            f(slot)
        })
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn room_exists(&self, code: &RoomCode) -> Result<bool> {
        self.with_rooms(|rooms| Ok(rooms.contains_key(code)))
    }

    async fn create_room(&self, meta: RoomMeta, state: CastState) -> Result<bool> {
        let capacity = self.inner.capacity;
        self.with_rooms(|rooms| {
            if rooms.contains_key(&meta.code) {
                return Ok(false);
            }
            rooms.insert(meta.code.clone(), RoomSlot::new(meta, state, capacity));
            Ok(true)
        })
    }

    async fn delete_room(&self, code: &RoomCode) -> Result<bool> {
        self.with_rooms(|rooms| {
            let Some(slot) = rooms.remove(code) else {
                return Ok(false);
            };
            let _ = slot.members_tx.send(MemberEvent::RoomGone);
            let _ = slot.state_tx.send(StateEvent::RoomGone);
            let _ = slot.log_tx.send(LogEvent::RoomGone);
            Ok(true)
        })
    }

    async fn rooms(&self) -> Result<Vec<RoomCode>> {
        self.with_rooms(|rooms| {
            let mut codes: Vec<RoomCode> = rooms.keys().cloned().collect();
            codes.sort();
            Ok(codes)
        })
    }

    async fn meta(&self, code: &RoomCode) -> Result<Option<RoomMeta>> {
        self.with_rooms(|rooms| Ok(rooms.get(code).map(|slot| slot.meta.clone())))
    }

    async fn upsert_participant(&self, code: &RoomCode, identity: &str, joined_at: u64) -> Result<()> {
        self.with_room(code, |slot| {
            let previous = slot.meta.participants.insert(identity.to_string(), joined_at);
            if previous != Some(joined_at) {
                let _ = slot.members_tx.send(MemberEvent::Changed(slot.meta.clone()));
            }
            Ok(())
        })
    }

    async fn remove_participant(&self, code: &RoomCode, identity: &str) -> Result<bool> {
        self.with_room(code, |slot| {
            let removed = slot.meta.participants.remove(identity).is_some();
            if removed {
                let _ = slot.members_tx.send(MemberEvent::Changed(slot.meta.clone()));
            }
            Ok(removed)
        })
    }

    async fn read_state(&self, code: &RoomCode) -> Result<CastState> {
        self.with_room(code, |slot| Ok(slot.state.clone()))
    }

    async fn write_state(&self, code: &RoomCode, state: CastState) -> Result<()> {
        self.with_room(code, |slot| {
            slot.state = state;
            let _ = slot.state_tx.send(StateEvent::Snapshot(slot.state.clone()));
            Ok(())
        })
    }

    async fn append_command(&self, code: &RoomCode, envelope: CommandEnvelope) -> Result<()> {
        self.with_room(code, |slot| {
            slot.commands.push(envelope.clone());
            let _ = slot.log_tx.send(LogEvent::Added(envelope));
            Ok(())
        })
    }

    async fn set_command_status(
        &self,
        code: &RoomCode,
        id: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<CommandEnvelope> {
        self.with_room(code, |slot| {
            let envelope = slot
                .commands
                .iter_mut()
                .find(|env| env.id == id)
                .ok_or_else(|| CastError::CommandNotFound {
                    room: code.to_string(),
                    id: id.to_string(),
                })?;
            if !envelope.status.can_advance_to(status) {
                return Err(CastError::InvalidTransition {
                    id: id.to_string(),
                    from: envelope.status,
                    to: status,
                });
            }
            envelope.status = status;
            if error.is_some() {
                envelope.error = error;
            }
            let updated = envelope.clone();
            let _ = slot.log_tx.send(LogEvent::StatusChanged(updated.clone()));
            Ok(updated)
        })
    }

    async fn commands(&self, code: &RoomCode) -> Result<Vec<CommandEnvelope>> {
        self.with_room(code, |slot| Ok(slot.commands.clone()))
    }

    async fn remove_commands(&self, code: &RoomCode, ids: &[String]) -> Result<usize> {
        self.with_room(code, |slot| {
            let before = slot.commands.len();
            slot.commands.retain(|env| !ids.contains(&env.id));
            let removed = before - slot.commands.len();
            if removed > 0 {
                let _ = slot.log_tx.send(LogEvent::Removed(ids.to_vec()));
            }
            Ok(removed)
        })
    }

    async fn watch_members(&self, code: &RoomCode) -> Result<(RoomMeta, broadcast::Receiver<MemberEvent>)> {
        self.with_room(code, |slot| Ok((slot.meta.clone(), slot.members_tx.subscribe())))
    }

    async fn watch_state(&self, code: &RoomCode) -> Result<(CastState, broadcast::Receiver<StateEvent>)> {
        self.with_room(code, |slot| Ok((slot.state.clone(), slot.state_tx.subscribe())))
    }

    async fn watch_commands(
        &self,
        code: &RoomCode,
    ) -> Result<(Vec<CommandEnvelope>, broadcast::Receiver<LogEvent>)> {
        self.with_room(code, |slot| Ok((slot.commands.clone(), slot.log_tx.subscribe())))
    }

    async fn acquire_lease(&self, code: &RoomCode, owner: &str, now: u64, ttl_ms: u64) -> Result<LeaseOutcome> {
        self.with_room(code, |slot| {
            if let Some(lease) = &slot.lease {
                if lease.owner != owner && lease.expires_at > now {
                    return Ok(LeaseOutcome::Held {
                        owner: lease.owner.clone(),
                        expires_at: lease.expires_at,
                    });
                }
            }
            let expires_at = now.saturating_add(ttl_ms);
            slot.lease = Some(Lease { owner: owner.to_string(), expires_at });
            Ok(LeaseOutcome::Acquired { expires_at })
        })
    }

    async fn release_lease(&self, code: &RoomCode, owner: &str) -> Result<()> {
        self.with_room(code, |slot| {
            if slot.lease.as_ref().is_some_and(|l| l.owner == owner) {
                slot.lease = None;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Origin};

    fn code(raw: &str) -> RoomCode {
        RoomCode::parse(raw).unwrap()
    }

    async fn store_with_room(raw: &str) -> MemoryStore {
        let store = MemoryStore::default();
        let created = store
            .create_room(RoomMeta::new(code(raw), "host", 1), CastState::default())
            .await
            .unwrap();
        assert!(created);
        store
    }

    #[tokio::test]
    async fn test_create_room_rejects_live_code() {
        let store = store_with_room("0001").await;
        let again = store
            .create_room(RoomMeta::new(code("0001"), "other", 2), CastState::default())
            .await
            .unwrap();
        assert!(!again);
        assert_eq!(store.meta(&code("0001")).await.unwrap().unwrap().host_id, "host");
    }

    #[tokio::test]
    async fn test_offline_store_fails_closed() {
        let store = store_with_room("0001").await;
        store.set_online(false);
        let err = store
            .append_command(&code("0001"), CommandEnvelope::pending(Command::Play, Origin::Controller, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::StoreUnavailable(_)));
        store.set_online(true);
        assert!(store.commands(&code("0001")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_room_reports_not_found() {
        let store = MemoryStore::default();
        let err = store.read_state(&code("4242")).await.unwrap_err();
        assert!(matches!(err, CastError::RoomNotFound(c) if c == "4242"));
    }

    #[tokio::test]
    async fn test_status_cannot_move_backwards() {
        let store = store_with_room("0001").await;
        let env = CommandEnvelope::pending(Command::Play, Origin::Controller, 0);
        let id = env.id.clone();
        store.append_command(&code("0001"), env).await.unwrap();
        store
            .set_command_status(&code("0001"), &id, CommandStatus::Executing, None)
            .await
            .unwrap();
        store
            .set_command_status(&code("0001"), &id, CommandStatus::Completed, None)
            .await
            .unwrap();
        let err = store
            .set_command_status(&code("0001"), &id, CommandStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_failed_status_records_error() {
        let store = store_with_room("0001").await;
        let env = CommandEnvelope::pending(Command::Pause, Origin::Controller, 0);
        let id = env.id.clone();
        store.append_command(&code("0001"), env).await.unwrap();
        store.set_command_status(&code("0001"), &id, CommandStatus::Executing, None).await.unwrap();
        let env = store
            .set_command_status(&code("0001"), &id, CommandStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(env.status, CommandStatus::Failed);
        assert_eq!(env.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_delete_room_notifies_every_stream() {
        let store = store_with_room("0007").await;
        let (_, mut members) = store.watch_members(&code("0007")).await.unwrap();
        let (_, mut state) = store.watch_state(&code("0007")).await.unwrap();
        let (_, mut log) = store.watch_commands(&code("0007")).await.unwrap();

        assert!(store.delete_room(&code("0007")).await.unwrap());

        assert_eq!(members.recv().await.unwrap(), MemberEvent::RoomGone);
        assert_eq!(state.recv().await.unwrap(), StateEvent::RoomGone);
        assert_eq!(log.recv().await.unwrap(), LogEvent::RoomGone);
        assert!(!store.room_exists(&code("0007")).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_state_broadcasts_full_snapshot() {
        let store = store_with_room("0001").await;
        let (initial, mut rx) = store.watch_state(&code("0001")).await.unwrap();
        assert_eq!(initial, CastState::default());

        let mut next = CastState::default();
        next.controls.is_playing = true;
        store.write_state(&code("0001"), next.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), StateEvent::Snapshot(next));
    }

    #[tokio::test]
    async fn test_upsert_participant_is_idempotent() {
        let store = store_with_room("0001").await;
        let (_, mut rx) = store.watch_members(&code("0001")).await.unwrap();
        store.upsert_participant(&code("0001"), "guest", 5).await.unwrap();
        store.upsert_participant(&code("0001"), "guest", 5).await.unwrap();
        let meta = store.meta(&code("0001")).await.unwrap().unwrap();
        assert_eq!(meta.participants.len(), 2);
        assert!(matches!(rx.recv().await.unwrap(), MemberEvent::Changed(_)));
        assert!(rx.try_recv().is_err(), "second identical upsert must not notify");
    }

    #[tokio::test]
    async fn test_remove_commands_by_id() {
        let store = store_with_room("0001").await;
        let a = CommandEnvelope::pending(Command::Play, Origin::Controller, 0);
        let b = CommandEnvelope::pending(Command::Pause, Origin::Controller, 0);
        let a_id = a.id.clone();
        store.append_command(&code("0001"), a).await.unwrap();
        store.append_command(&code("0001"), b).await.unwrap();
        let removed = store.remove_commands(&code("0001"), &[a_id, "nope".into()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.commands(&code("0001")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_excludes_second_owner_until_expiry() {
        let store = store_with_room("0001").await;
        let c = code("0001");
        assert_eq!(
            store.acquire_lease(&c, "p1", 1_000, 500).await.unwrap(),
            LeaseOutcome::Acquired { expires_at: 1_500 }
        );
        assert_eq!(
            store.acquire_lease(&c, "p2", 1_200, 500).await.unwrap(),
            LeaseOutcome::Held { owner: "p1".into(), expires_at: 1_500 }
        );
        // Renewal by the holder extends it.
        assert_eq!(
            store.acquire_lease(&c, "p1", 1_400, 500).await.unwrap(),
            LeaseOutcome::Acquired { expires_at: 1_900 }
        );
        // Expired: anyone may take it.
        assert!(matches!(
            store.acquire_lease(&c, "p2", 2_000, 500).await.unwrap(),
            LeaseOutcome::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_lease_only_by_owner() {
        let store = store_with_room("0001").await;
        let c = code("0001");
        store.acquire_lease(&c, "p1", 0, 10_000).await.unwrap();
        store.release_lease(&c, "p2").await.unwrap();
        assert!(matches!(store.acquire_lease(&c, "p2", 1, 100).await.unwrap(), LeaseOutcome::Held { .. }));
        store.release_lease(&c, "p1").await.unwrap();
        assert!(matches!(store.acquire_lease(&c, "p2", 1, 100).await.unwrap(), LeaseOutcome::Acquired { .. }));
    }

    #[tokio::test]
    async fn test_room_reads_all_records() {
        let store = store_with_room("0001").await;
        store
            .append_command(&code("0001"), CommandEnvelope::pending(Command::Next, Origin::Controller, 3))
            .await
            .unwrap();
        let room = store.room(&code("0001")).await.unwrap();
        assert_eq!(room.meta.host_id, "host");
        assert_eq!(room.commands.len(), 1);
        assert_eq!(room.state, CastState::default());
    }

    #[tokio::test]
    async fn test_rooms_are_listed_sorted() {
        let store = store_with_room("0009").await;
        store
            .create_room(RoomMeta::new(code("0002"), "h", 0), CastState::default())
            .await
            .unwrap();
        assert_eq!(store.rooms().await.unwrap(), vec![code("0002"), code("0009")]);
    }
}
