//! JSON text-frame protocol spoken between relay and clients.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! {"event": "card-updated", "data": {"boardId": 1, "listId": 7, "card": {...}}}
//! {"event": "join-board",   "data": 1}
//! {"event": "user-joined",  "data": {"userId": 3, "username": "ana", "boardId": 1}}
//! ```
//!
//! `join-board`, `leave-board` and the mutation/typing events flow client to
//! relay; `user-joined`, `user-left`, `online-users` and `join-refused` only
//! flow relay to client. A `join-board` is answered by exactly one of
//! `online-users` or `join-refused`. Mutation and typing events are fanned out unchanged apart from the
//! relay stamping `userId` onto typing events.

use corkboard_core::event::{CardCreated, CardDeleted, CardUpdated, ListCreated, ListDeleted, ListUpdated};
use corkboard_core::{BoardId, MutationEvent, PresenceUser, SyncError, TypingEvent, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `user-joined` payload. `boardId` is added by this relay so a client in
/// several rooms can attribute the change; older peers may omit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<BoardId>,
}

impl UserJoined {
    pub fn user(&self) -> PresenceUser {
        PresenceUser::new(self.user_id, self.username.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<BoardId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsers {
    pub board_id: BoardId,
    pub users: Vec<PresenceUser>,
}

/// `join-refused` payload: the relay did not admit the connection to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRefused {
    pub board_id: BoardId,
    pub reason: String,
}

/// Every frame either side may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Frame {
    JoinBoard(BoardId),
    LeaveBoard(BoardId),
    ListCreated(ListCreated),
    ListUpdated(ListUpdated),
    ListDeleted(ListDeleted),
    CardCreated(CardCreated),
    CardUpdated(CardUpdated),
    CardDeleted(CardDeleted),
    UserTyping(TypingEvent),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    OnlineUsers(OnlineUsers),
    JoinRefused(JoinRefused),
}

impl Frame {
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Decode(e.to_string()))
    }

    /// Wire name of this frame.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::JoinBoard(_) => "join-board",
            Frame::LeaveBoard(_) => "leave-board",
            Frame::UserTyping(_) => "user-typing",
            Frame::UserJoined(_) => "user-joined",
            Frame::UserLeft(_) => "user-left",
            Frame::OnlineUsers(_) => "online-users",
            Frame::JoinRefused(_) => "join-refused",
            other => match other.mutation() {
                Some(event) => event.name(),
                None => "unknown",
            },
        }
    }

    /// Room a client-originated event is addressed to.
    pub fn board_id(&self) -> Option<BoardId> {
        match self {
            Frame::JoinBoard(id) | Frame::LeaveBoard(id) => Some(*id),
            Frame::UserTyping(e) => Some(e.board_id),
            Frame::OnlineUsers(e) => Some(e.board_id),
            Frame::JoinRefused(e) => Some(e.board_id),
            Frame::UserJoined(e) => e.board_id,
            Frame::UserLeft(e) => e.board_id,
            other => other.mutation().map(|event| event.board_id()),
        }
    }

    /// The mutation event carried by this frame, if any.
    pub fn mutation(&self) -> Option<MutationEvent> {
        let event = match self {
            Frame::ListCreated(e) => MutationEvent::ListCreated(e.clone()),
            Frame::ListUpdated(e) => MutationEvent::ListUpdated(e.clone()),
            Frame::ListDeleted(e) => MutationEvent::ListDeleted(e.clone()),
            Frame::CardCreated(e) => MutationEvent::CardCreated(e.clone()),
            Frame::CardUpdated(e) => MutationEvent::CardUpdated(e.clone()),
            Frame::CardDeleted(e) => MutationEvent::CardDeleted(e.clone()),
            _ => return None,
        };
        Some(event)
    }

    /// Frames a client may send for fan-out to its room.
    pub fn is_room_event(&self) -> bool {
        matches!(self, Frame::UserTyping(_)) || self.mutation().is_some()
    }
}

impl From<MutationEvent> for Frame {
    fn from(event: MutationEvent) -> Self {
        match event {
            MutationEvent::ListCreated(e) => Frame::ListCreated(e),
            MutationEvent::ListUpdated(e) => Frame::ListUpdated(e),
            MutationEvent::ListDeleted(e) => Frame::ListDeleted(e),
            MutationEvent::CardCreated(e) => Frame::CardCreated(e),
            MutationEvent::CardUpdated(e) => Frame::CardUpdated(e),
            MutationEvent::CardDeleted(e) => Frame::CardDeleted(e),
        }
    }
}

/// Transport-level failures of the broadcast channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),
    #[error("credential rejected during handshake")]
    Unauthorized,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("channel closed")]
    Closed,
}

impl From<ChannelError> for SyncError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => SyncError::ChannelDisconnected,
            other => SyncError::Protocol(other.to_string()),
        }
    }
}
