use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A per-user notification row. Content is immutable once created; only the
/// read state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Live push payload for `notification:new`.
///
/// Personal pushes carry the stored row's id and recipient; the aggregate
/// admin-dashboard push carries the same content without them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Notification> for NotificationEvent {
    fn from(n: &Notification) -> Self {
        NotificationEvent {
            id: Some(n.id.clone()),
            recipient_id: Some(n.recipient_id.clone()),
            tenant_id: n.tenant_id.clone(),
            kind: n.kind.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            is_read: n.is_read,
            created_at: n.created_at,
        }
    }
}

impl NotificationEvent {
    /// Strips per-recipient addressing, leaving the shared content.
    pub fn aggregate(mut self) -> Self {
        self.id = None;
        self.recipient_id = None;
        self
    }
}
