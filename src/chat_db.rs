use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::clock::{from_millis, Clock, MonotonicStamp};
use crate::error::StoreError;
use crate::models::{
    validate_body, Attachment, ChatMessage, EditRecord, MessageKind, NewMessage, Notification,
};
use crate::store::{new_id, MessageStore, NotificationStore};

pub const MESSAGES: &str = "chat_messages";
pub const NOTIFICATIONS: &str = "notifications";

pub struct MongoDB {
    pub client: Client,
    pub db: Database,
}

impl MongoDB {
    pub async fn init(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client_options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(client_options)?;
        let db = client.database(db_name);
        Ok(MongoDB { client, db })
    }

    /// Creates the room, rate-limit, notification and TTL indexes.
    pub async fn ensure_indexes(&self, retention: StdDuration) -> Result<(), StoreError> {
        let messages = self.db.collection::<MessageDocument>(MESSAGES);
        messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "tenantId": 1, "taskId": 1, "timestamp": 1 })
                    .build(),
            )
            .await?;
        messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "tenantId": 1, "senderId": 1, "timestamp": 1 })
                    .build(),
            )
            .await?;
        messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "timestamp": 1 })
                    .options(IndexOptions::builder().expire_after(retention).build())
                    .build(),
            )
            .await?;

        self.db
            .collection::<NotificationDocument>(NOTIFICATIONS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "tenantId": 1, "recipientId": 1, "createdAt": -1 })
                    .build(),
            )
            .await?;
        info!("chat indexes ensured (retention {}s)", retention.as_secs());
        Ok(())
    }
}

fn unread_claim(tenant_id: &str, id: &str) -> Document {
    doc! { "_id": id, "tenantId": tenant_id, "read": false, "readAt": null }
}

fn to_bson(t: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(t.timestamp_millis())
}

fn from_bson(t: BsonDateTime) -> DateTime<Utc> {
    from_millis(t.timestamp_millis()).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditDocument {
    body: String,
    edited_at: BsonDateTime,
}

/// Stored shape of a chat message; datetimes are BSON so the TTL index
/// applies to `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDocument {
    #[serde(rename = "_id")]
    id: String,
    tenant_id: String,
    task_id: String,
    sender_id: String,
    sender_name: String,
    receiver_id: String,
    body: String,
    kind: MessageKind,
    #[serde(default)]
    attachments: Vec<Attachment>,
    timestamp: BsonDateTime,
    delivered: bool,
    delivered_at: Option<BsonDateTime>,
    read: bool,
    read_at: Option<BsonDateTime>,
    edited: bool,
    #[serde(default)]
    edit_history: Vec<EditDocument>,
    deleted: bool,
    deleted_at: Option<BsonDateTime>,
}

impl From<&ChatMessage> for MessageDocument {
    fn from(m: &ChatMessage) -> Self {
        MessageDocument {
            id: m.id.clone(),
            tenant_id: m.tenant_id.clone(),
            task_id: m.task_id.clone(),
            sender_id: m.sender_id.clone(),
            sender_name: m.sender_name.clone(),
            receiver_id: m.receiver_id.clone(),
            body: m.body.clone(),
            kind: m.kind,
            attachments: m.attachments.clone(),
            timestamp: to_bson(m.timestamp),
            delivered: m.delivered,
            delivered_at: m.delivered_at.map(to_bson),
            read: m.read,
            read_at: m.read_at.map(to_bson),
            edited: m.edited,
            edit_history: m
                .edit_history
                .iter()
                .map(|e| EditDocument {
                    body: e.body.clone(),
                    edited_at: to_bson(e.edited_at),
                })
                .collect(),
            deleted: m.deleted,
            deleted_at: m.deleted_at.map(to_bson),
        }
    }
}

impl From<MessageDocument> for ChatMessage {
    fn from(d: MessageDocument) -> Self {
        ChatMessage {
            id: d.id,
            tenant_id: d.tenant_id,
            task_id: d.task_id,
            sender_id: d.sender_id,
            sender_name: d.sender_name,
            receiver_id: d.receiver_id,
            body: d.body,
            kind: d.kind,
            attachments: d.attachments,
            timestamp: from_bson(d.timestamp),
            delivered: d.delivered,
            delivered_at: d.delivered_at.map(from_bson),
            read: d.read,
            read_at: d.read_at.map(from_bson),
            edited: d.edited,
            edit_history: d
                .edit_history
                .into_iter()
                .map(|e| EditRecord {
                    body: e.body,
                    edited_at: from_bson(e.edited_at),
                })
                .collect(),
            deleted: d.deleted,
            deleted_at: d.deleted_at.map(from_bson),
        }
    }
}

pub struct MongoMessageStore {
    messages: Collection<MessageDocument>,
    clock: Arc<dyn Clock>,
    stamp: MonotonicStamp,
    max_body_len: usize,
}

impl MongoMessageStore {
    pub fn new(db: &Database, clock: Arc<dyn Clock>, max_body_len: usize) -> Self {
        MongoMessageStore {
            messages: db.collection::<MessageDocument>(MESSAGES),
            clock,
            stamp: MonotonicStamp::new(),
            max_body_len,
        }
    }
}

#[async_trait]
impl MessageStore for MongoMessageStore {
    async fn append(&self, draft: NewMessage) -> Result<ChatMessage, StoreError> {
        validate_body(&draft.body, self.max_body_len)?;
        let timestamp = self.stamp.next(self.clock.now());
        let message = draft.into_message(new_id(), timestamp);
        self.messages
            .insert_one(MessageDocument::from(&message))
            .await?;
        Ok(message)
    }

    async fn get(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let found = self
            .messages
            .find_one(doc! { "_id": message_id, "tenantId": tenant_id })
            .await?;
        Ok(found.map(ChatMessage::from))
    }

    async fn list_by_room(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let docs: Vec<MessageDocument> = self
            .messages
            .find(doc! { "tenantId": tenant_id, "taskId": task_id, "deleted": false })
            .sort(doc! { "timestamp": 1, "_id": 1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(ChatMessage::from).collect())
    }

    async fn mark_read(
        &self,
        tenant_id: &str,
        task_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let filter = doc! {
            "tenantId": tenant_id,
            "taskId": task_id,
            "receiverId": user_id,
            "read": false,
            "deleted": false,
        };
        let unread: Vec<MessageDocument> = self.messages.find(filter).await?.try_collect().await?;
        let now = to_bson(self.clock.now());
        let mut marked = Vec::new();
        // Each row is claimed on its own so a concurrent reader reports it at most once.
        for doc in unread {
            let result = self
                .messages
                .update_one(
                    unread_claim(tenant_id, &doc.id),
                    doc! { "$set": { "read": true, "readAt": now, "delivered": true } },
                )
                .await?;
            if result.modified_count == 1 {
                marked.push(doc.id);
            }
        }
        Ok(marked)
    }

    async fn edit(
        &self,
        tenant_id: &str,
        message_id: &str,
        new_body: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        validate_body(new_body, self.max_body_len)?;
        let Some(current) = self
            .messages
            .find_one(doc! { "_id": message_id, "tenantId": tenant_id, "deleted": false })
            .await?
        else {
            return Ok(None);
        };
        let now = to_bson(self.clock.now());
        // Conditional on the body we read, so a concurrent edit cannot lose history.
        let updated = self
            .messages
            .find_one_and_update(
                doc! { "_id": message_id, "tenantId": tenant_id, "deleted": false, "body": current.body.as_str() },
                doc! {
                    "$set": { "body": new_body.trim(), "edited": true },
                    "$push": { "editHistory": { "body": current.body.as_str(), "editedAt": now } },
                },
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated.map(ChatMessage::from))
    }

    async fn soft_delete(&self, tenant_id: &str, message_id: &str) -> Result<bool, StoreError> {
        let now = to_bson(self.clock.now());
        let result = self
            .messages
            .update_one(
                doc! { "_id": message_id, "tenantId": tenant_id, "deleted": false },
                doc! { "$set": { "deleted": true, "deletedAt": now } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        task_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let mut filter = doc! {
            "tenantId": tenant_id,
            "deleted": false,
            "body": { "$regex": regex::escape(query), "$options": "i" },
        };
        if let Some(task_id) = task_id {
            filter.insert("taskId", task_id);
        }
        let docs: Vec<MessageDocument> = self
            .messages
            .find(filter)
            .sort(doc! { "timestamp": -1, "_id": -1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(ChatMessage::from).collect())
    }

    async fn count_sent_since(
        &self,
        tenant_id: &str,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count = self
            .messages
            .count_documents(doc! {
                "tenantId": tenant_id,
                "senderId": sender_id,
                "timestamp": { "$gt": to_bson(since) },
            })
            .await?;
        Ok(count)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = self
            .messages
            .delete_many(doc! { "timestamp": { "$lt": to_bson(before) } })
            .await?;
        Ok(result.deleted_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationDocument {
    #[serde(rename = "_id")]
    id: String,
    tenant_id: String,
    recipient_id: String,
    #[serde(rename = "type")]
    kind: String,
    title: String,
    body: String,
    is_read: bool,
    read_at: Option<BsonDateTime>,
    created_at: BsonDateTime,
}

impl From<&Notification> for NotificationDocument {
    fn from(n: &Notification) -> Self {
        NotificationDocument {
            id: n.id.clone(),
            tenant_id: n.tenant_id.clone(),
            recipient_id: n.recipient_id.clone(),
            kind: n.kind.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            is_read: n.is_read,
            read_at: n.read_at.map(to_bson),
            created_at: to_bson(n.created_at),
        }
    }
}

impl From<NotificationDocument> for Notification {
    fn from(d: NotificationDocument) -> Self {
        Notification {
            id: d.id,
            tenant_id: d.tenant_id,
            recipient_id: d.recipient_id,
            kind: d.kind,
            title: d.title,
            body: d.body,
            is_read: d.is_read,
            read_at: d.read_at.map(from_bson),
            created_at: from_bson(d.created_at),
        }
    }
}

pub struct MongoNotificationStore {
    notifications: Collection<NotificationDocument>,
    clock: Arc<dyn Clock>,
}

impl MongoNotificationStore {
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        MongoNotificationStore {
            notifications: db.collection::<NotificationDocument>(NOTIFICATIONS),
            clock,
        }
    }
}

#[async_trait]
impl NotificationStore for MongoNotificationStore {
    async fn insert_many(&self, rows: &[Notification]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let docs: Vec<NotificationDocument> = rows.iter().map(NotificationDocument::from).collect();
        self.notifications.insert_many(docs).await?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Notification>, StoreError> {
        let found = self
            .notifications
            .find_one(doc! { "_id": id, "tenantId": tenant_id })
            .await?;
        Ok(found.map(Notification::from))
    }

    async fn list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut filter = doc! { "tenantId": tenant_id, "recipientId": user_id };
        if unread_only {
            filter.insert("isRead", false);
        }
        let docs: Vec<NotificationDocument> = self
            .notifications
            .find(filter)
            .sort(doc! { "createdAt": -1, "_id": -1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Notification::from).collect())
    }

    async fn mark_read(&self, tenant_id: &str, id: &str) -> Result<bool, StoreError> {
        let now = to_bson(self.clock.now());
        let result = self
            .notifications
            .update_one(
                doc! { "_id": id, "tenantId": tenant_id },
                vec![doc! { "$set": {
                    "readAt": { "$ifNull": ["$readAt", now] },
                    "isRead": true,
                } }],
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn mark_all_read(&self, tenant_id: &str, user_id: &str) -> Result<u64, StoreError> {
        let now = to_bson(self.clock.now());
        let result = self
            .notifications
            .update_many(
                doc! { "tenantId": tenant_id, "recipientId": user_id, "isRead": false },
                doc! { "$set": { "isRead": true, "readAt": now } },
            )
            .await?;
        Ok(result.modified_count)
    }
}
