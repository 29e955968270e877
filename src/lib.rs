//! Room-based command and state synchronization between a controller device
//! and a video player that share nothing but a real-time store.
//!
//! Controllers append commands to a room's log and read its state. The player
//! is the only writer of state: its executor applies each pending command to
//! the queue/playback state machine, persists the result, and drives the
//! embedded playback widget.

pub mod channel;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod machine;
pub mod model;
pub mod player;
pub mod registry;
pub mod retention;
pub mod store;
pub mod sync;
pub mod widget;

pub use channel::{CommandChannel, PendingCommands};
pub use config::CastConfig;
pub use error::{CastError, Result};
pub use executor::{CommandExecutor, RoomLocks};
pub use model::{CastState, CatalogItem, Command, CommandEnvelope, CommandStatus, Identity, Origin, QueueItem, RoomCode};
pub use player::PlayerSession;
pub use registry::RoomRegistry;
pub use retention::{Retention, SweepReport};
pub use store::{MemoryStore, RealtimeStore};
pub use sync::{Controller, StateSync, StateWatch};
