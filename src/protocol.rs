//! Event frames carried over the bidirectional socket.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`. The
//! set of events is closed: anything else fails to parse.

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::models::{ChatMessage, NotificationEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageFrame {
    pub message: String,
    pub receiver_id: String,
    pub task_id: String,
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingFrame {
    pub receiver_id: String,
}

/// Client-to-server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    SendMessage(SendMessageFrame),
    JoinTaskRoom(String),
    LeaveTaskRoom(String),
    Typing(TypingFrame),
    RoomTyping(String),
    MarkRead(String),
}

/// A chat message push, echoing the sender's correlation token when the
/// push confirms that sender's own send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTyping {
    pub task_id: String,
    pub user_id: String,
}

/// A send or frame the server refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub code: String,
    pub message: String,
}

impl Rejection {
    pub fn from_error(temp_id: Option<String>, err: &ChatError) -> Self {
        let code = match err {
            ChatError::Unauthorized(auth) => auth.code(),
            other => other.code(),
        };
        Rejection {
            temp_id,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

/// Server-to-client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    MessageReceived(ReceivedMessage),
    MessageDelivered(MessageRef),
    MessageSeen(MessageRef),
    MessageEdited(ChatMessage),
    MessageDeleted(MessageRef),
    MessageRejected(Rejection),
    UserOnline(UserRef),
    UserOffline(UserRef),
    Typing(UserRef),
    RoomTyping(RoomTyping),
    #[serde(rename = "notification:new")]
    NotificationNew(NotificationEvent),
    TokenExpired,
    Error(Rejection),
}

/// Discriminant of [`ServerEvent`], used to key client-side handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    MessageDelivered,
    MessageSeen,
    MessageEdited,
    MessageDeleted,
    MessageRejected,
    UserOnline,
    UserOffline,
    Typing,
    RoomTyping,
    NotificationNew,
    TokenExpired,
    Error,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::MessageReceived(_) => EventKind::MessageReceived,
            ServerEvent::MessageDelivered(_) => EventKind::MessageDelivered,
            ServerEvent::MessageSeen(_) => EventKind::MessageSeen,
            ServerEvent::MessageEdited(_) => EventKind::MessageEdited,
            ServerEvent::MessageDeleted(_) => EventKind::MessageDeleted,
            ServerEvent::MessageRejected(_) => EventKind::MessageRejected,
            ServerEvent::UserOnline(_) => EventKind::UserOnline,
            ServerEvent::UserOffline(_) => EventKind::UserOffline,
            ServerEvent::Typing(_) => EventKind::Typing,
            ServerEvent::RoomTyping(_) => EventKind::RoomTyping,
            ServerEvent::NotificationNew(_) => EventKind::NotificationNew,
            ServerEvent::TokenExpired => EventKind::TokenExpired,
            ServerEvent::Error(_) => EventKind::Error,
        }
    }
}
