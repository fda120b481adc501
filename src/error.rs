use axum::http::StatusCode;
use thiserror::Error;

use crate::db::GroupId;

/// Failures of the realtime chat operations (join, leave, send, history).
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not signed in")]
    Unauthenticated,

    #[error("message is empty")]
    EmptyMessage,

    #[error("message is longer than {max} characters")]
    MessageTooLong { max: usize },

    #[error("group {0} does not exist")]
    RoomNotFound(GroupId),

    #[error("not a member of group {0}")]
    NotAMember(GroupId),

    /// The message store or directory lookup failed. Never retried here.
    #[error("store failure: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The connection went away mid-operation. Handled by disconnect cleanup.
    #[error("connection closed")]
    Transport,
}

impl ChatError {
    /// Stable identifier sent to clients in `error` events and JSON bodies.
    pub fn code(&self) -> &'static str {
        use ChatError::*;
        match self {
            Unauthenticated => "unauthenticated",
            EmptyMessage => "empty_message",
            MessageTooLong { .. } => "message_too_long",
            RoomNotFound(_) => "room_not_found",
            NotAMember(_) => "not_a_member",
            Persistence(_) => "persistence_error",
            Transport => "transport_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        use ChatError::*;
        match self {
            Unauthenticated => StatusCode::UNAUTHORIZED,
            EmptyMessage | MessageTooLong { .. } => StatusCode::BAD_REQUEST,
            RoomNotFound(_) => StatusCode::NOT_FOUND,
            NotAMember(_) => StatusCode::FORBIDDEN,
            Persistence(_) | Transport => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Validation failures are the caller's fault and are logged quietly.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, ChatError::Persistence(_) | ChatError::Transport)
    }
}
