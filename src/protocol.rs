//! Frames exchanged over the chat WebSocket.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::{
    db::{GroupId, GroupMessage},
    error::ChatError,
};

/// Sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    SendMessage {
        group_id: GroupId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_token: Option<String>,
    },
}

impl ClientEvent {
    pub fn action(&self) -> Action {
        match self {
            ClientEvent::JoinGroup { .. } => Action::JoinGroup,
            ClientEvent::LeaveGroup { .. } => Action::LeaveGroup,
            ClientEvent::SendMessage { .. } => Action::SendMessage,
        }
    }

    pub fn group_id(&self) -> GroupId {
        match self {
            ClientEvent::JoinGroup { group_id }
            | ClientEvent::LeaveGroup { group_id }
            | ClientEvent::SendMessage { group_id, .. } => *group_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    JoinGroup,
    LeaveGroup,
    SendMessage,
}

/// Sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The connection is now a member of the room.
    Joined { group_id: GroupId },
    Left { group_id: GroupId },
    GroupMessage(GroupMessage),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub code: String,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(action: Action, group_id: GroupId, err: &ChatError) -> Self {
        Self {
            action: Some(action),
            group_id: Some(group_id),
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            action: None,
            group_id: None,
            code: "bad_request".to_owned(),
            message: message.into(),
        }
    }
}
