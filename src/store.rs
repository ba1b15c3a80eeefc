//! Durable state for chat messages and notifications. Every query is tenant-scoped.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, MonotonicStamp};
use crate::config::ChatLimits;
use crate::error::StoreError;
use crate::models::{validate_body, ChatMessage, EditRecord, NewMessage, Notification};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Validates and persists a message. The returned row is already
    /// flagged delivered.
    async fn append(&self, draft: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Direct lookup. Soft-deleted rows are still returned.
    async fn get(&self, tenant_id: &str, message_id: &str)
        -> Result<Option<ChatMessage>, StoreError>;

    /// Live messages of a room, oldest first, ties broken by id.
    async fn list_by_room(&self, tenant_id: &str, task_id: &str)
        -> Result<Vec<ChatMessage>, StoreError>;

    /// Flags every unread message addressed to `user_id` in the room as read
    /// and returns the ids it flipped.
    async fn mark_read(
        &self,
        tenant_id: &str,
        task_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Replaces the body, keeping the previous one in the edit history.
    /// `None` when the message does not exist or is deleted.
    async fn edit(
        &self,
        tenant_id: &str,
        message_id: &str,
        new_body: &str,
    ) -> Result<Option<ChatMessage>, StoreError>;

    /// `false` when the message does not exist or is already deleted.
    async fn soft_delete(&self, tenant_id: &str, message_id: &str) -> Result<bool, StoreError>;

    /// Case-insensitive substring match over live bodies, newest first.
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        task_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Messages by `sender_id` with a timestamp strictly after `since`.
    async fn count_sent_since(
        &self,
        tenant_id: &str,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Hard-deletes rows older than `before`; returns how many went.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_many(&self, rows: &[Notification]) -> Result<(), StoreError>;

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Notification>, StoreError>;

    async fn list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError>;

    /// `false` when no such notification exists. Marking an already-read
    /// row is not an error.
    async fn mark_read(&self, tenant_id: &str, id: &str) -> Result<bool, StoreError>;

    async fn mark_all_read(&self, tenant_id: &str, user_id: &str) -> Result<u64, StoreError>;
}

pub(crate) fn room_order(a: &ChatMessage, b: &ChatMessage) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct MemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
    clock: Arc<dyn Clock>,
    stamp: MonotonicStamp,
    max_body_len: usize,
}

impl MemoryMessageStore {
    pub fn new(clock: Arc<dyn Clock>, max_body_len: usize) -> Self {
        MemoryMessageStore {
            messages: RwLock::new(Vec::new()),
            clock,
            stamp: MonotonicStamp::new(),
            max_body_len,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, draft: NewMessage) -> Result<ChatMessage, StoreError> {
        validate_body(&draft.body, self.max_body_len)?;
        let mut messages = self.messages.write().await;
        let timestamp = self.stamp.next(self.clock.now());
        let message = draft.into_message(new_id(), timestamp);
        messages.push(message.clone());
        Ok(message)
    }

    async fn get(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .find(|m| m.tenant_id == tenant_id && m.id == message_id)
            .cloned())
    }

    async fn list_by_room(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        let mut room: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.task_id == task_id && !m.deleted)
            .cloned()
            .collect();
        room.sort_by(room_order);
        Ok(room)
    }

    async fn mark_read(
        &self,
        tenant_id: &str,
        task_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut messages = self.messages.write().await;
        let now = self.clock.now();
        let mut flipped = Vec::new();
        for m in messages.iter_mut().filter(|m| {
            m.tenant_id == tenant_id
                && m.task_id == task_id
                && m.receiver_id == user_id
                && !m.read
                && !m.deleted
        }) {
            m.read = true;
            m.read_at = Some(now);
            if !m.delivered {
                m.delivered = true;
                m.delivered_at = Some(now);
            }
            flipped.push(m.id.clone());
        }
        Ok(flipped)
    }

    async fn edit(
        &self,
        tenant_id: &str,
        message_id: &str,
        new_body: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        validate_body(new_body, self.max_body_len)?;
        let mut messages = self.messages.write().await;
        let now = self.clock.now();
        let Some(m) = messages
            .iter_mut()
            .find(|m| m.tenant_id == tenant_id && m.id == message_id && !m.deleted)
        else {
            return Ok(None);
        };
        let prior = std::mem::replace(&mut m.body, new_body.trim().to_string());
        m.edit_history.push(EditRecord {
            body: prior,
            edited_at: now,
        });
        m.edited = true;
        Ok(Some(m.clone()))
    }

    async fn soft_delete(&self, tenant_id: &str, message_id: &str) -> Result<bool, StoreError> {
        let mut messages = self.messages.write().await;
        let now = self.clock.now();
        match messages
            .iter_mut()
            .find(|m| m.tenant_id == tenant_id && m.id == message_id && !m.deleted)
        {
            Some(m) => {
                m.deleted = true;
                m.deleted_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
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
        let matcher = RegexBuilder::new(&regex::escape(query))
            .case_insensitive(true)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let messages = self.messages.read().await;
        let mut hits: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id && !m.deleted)
            .filter(|m| task_id.map_or(true, |t| m.task_id == t))
            .filter(|m| matcher.is_match(&m.body))
            .cloned()
            .collect();
        hits.sort_by(|a, b| room_order(b, a));
        Ok(hits)
    }

    async fn count_sent_since(
        &self,
        tenant_id: &str,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.sender_id == sender_id && m.timestamp > since)
            .count() as u64)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut messages = self.messages.write().await;
        let len = messages.len();
        messages.retain(|m| m.timestamp >= before);
        Ok((len - messages.len()) as u64)
    }
}

pub struct MemoryNotificationStore {
    rows: RwLock<Vec<Notification>>,
    clock: Arc<dyn Clock>,
}

impl MemoryNotificationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryNotificationStore {
            rows: RwLock::new(Vec::new()),
            clock,
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert_many(&self, rows: &[Notification]) -> Result<(), StoreError> {
        self.rows.write().await.extend_from_slice(rows);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Notification>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|n| n.tenant_id == tenant_id && n.id == id)
            .cloned())
    }

    async fn list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = self.rows.read().await;
        let mut mine: Vec<Notification> = rows
            .iter()
            .filter(|n| n.tenant_id == tenant_id && n.recipient_id == user_id)
            .filter(|n| !unread_only || !n.is_read)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(mine)
    }

    async fn mark_read(&self, tenant_id: &str, id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().await;
        match rows.iter_mut().find(|n| n.tenant_id == tenant_id && n.id == id) {
            Some(n) => {
                if !n.is_read {
                    n.is_read = true;
                    n.read_at = Some(now);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_read(&self, tenant_id: &str, user_id: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().await;
        let mut flipped = 0;
        for n in rows
            .iter_mut()
            .filter(|n| n.tenant_id == tenant_id && n.recipient_id == user_id && !n.is_read)
        {
            n.is_read = true;
            n.read_at = Some(now);
            flipped += 1;
        }
        Ok(flipped)
    }
}

/// Deletes expired messages on a fixed interval until the task is dropped.
pub async fn run_retention_sweep(
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    limits: ChatLimits,
    every: StdDuration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let cutoff = limits.retention_cutoff(clock.now());
        match store.purge_expired(cutoff).await {
            Ok(0) => {}
            Ok(n) => log::info!("retention sweep removed {n} messages older than {cutoff}"),
            Err(e) => log::warn!("retention sweep failed: {e}"),
        }
    }
}
