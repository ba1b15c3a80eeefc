use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default bound on a message body, in characters.
pub const DEFAULT_MAX_BODY_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    /// Size in bytes.
    pub size: i64,
}

/// A prior body, kept when a message is edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    #[serde(rename = "message")]
    pub body: String,
    pub edited_at: DateTime<Utc>,
}

/// A task-scoped chat message as stored and as pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub tenant_id: String,
    pub task_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<EditRecord>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Everything the caller supplies when appending a message; the store
/// assigns the id, timestamp and lifecycle flags.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: String,
    pub task_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
}

impl NewMessage {
    /// Materialises the draft into a persisted row. The body is stored trimmed.
    pub fn into_message(self, id: String, timestamp: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id,
            tenant_id: self.tenant_id,
            task_id: self.task_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            receiver_id: self.receiver_id,
            body: self.body.trim().to_string(),
            kind: self.kind,
            attachments: self.attachments,
            timestamp,
            delivered: true,
            delivered_at: Some(timestamp),
            read: false,
            read_at: None,
            edited: false,
            edit_history: Vec::new(),
            deleted: false,
            deleted_at: None,
        }
    }
}

/// Checks a body against the emptiness and length bounds.
///
/// Emptiness is judged after trimming; length is counted in characters on the
/// body as submitted.
pub fn validate_body(body: &str, max_len: usize) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if body.chars().count() > max_len {
        return Err(ValidationError::MessageTooLong { max: max_len });
    }
    Ok(())
}
