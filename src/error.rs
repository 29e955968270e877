//! Crate-level error type.
//!
//! Every public registry, channel and executor operation returns
//! [`Result<T>`]; nothing in the crate is process-fatal.

use thiserror::Error;

use crate::model::CommandStatus;

/// Errors surfaced by the room, command and state operations.
#[derive(Debug, Error)]
pub enum CastError {
    /// The underlying real-time store is unreachable or misconfigured.
    /// No write is attempted when this is returned.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The room does not exist (never created, or deleted when the host left).
    #[error("room '{0}' not found")]
    RoomNotFound(String),

    /// A room code that is not exactly four ASCII digits.
    #[error("invalid room code '{0}': expected four digits")]
    InvalidRoomCode(String),

    /// Every candidate code drawn during room creation was already live.
    #[error("no free room code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },

    /// A status update named an envelope that is not in the room's log.
    #[error("command '{id}' not found in room '{room}'")]
    CommandNotFound { room: String, id: String },

    /// A status update would move an envelope backwards or skip a stage.
    #[error("command '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: CommandStatus,
        to: CommandStatus,
    },

    /// Raised while applying a command; captured into the envelope's `error`.
    #[error("command execution failed: {0}")]
    CommandExecution(String),

    /// The playback widget rejected or failed a call.
    #[error("playback widget error: {0}")]
    Widget(String),

    /// Another executor currently owns the room.
    #[error("room '{room}' is already driven by executor '{owner}'")]
    LeaseHeld { room: String, owner: String },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CastError {
    /// True for failures that leave the store untouched and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CastError::StoreUnavailable(_) | CastError::LeaseHeld { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_not_found_mentions_code() {
        let err = CastError::RoomNotFound("0420".to_string());
        assert!(err.to_string().contains("0420"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = CastError::InvalidTransition {
            id: "abc".to_string(),
            from: CommandStatus::Completed,
            to: CommandStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "command 'abc' cannot move from completed to pending"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(CastError::StoreUnavailable("down".into()).is_transient());
        assert!(CastError::LeaseHeld { room: "0001".into(), owner: "p".into() }.is_transient());
        assert!(!CastError::RoomNotFound("0001".into()).is_transient());
        assert!(!CastError::Widget("boom".into()).is_transient());
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: CastError = parse.unwrap_err().into();
        assert!(matches!(err, CastError::Serialization(_)));
    }
}
