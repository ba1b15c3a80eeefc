//! The send path: validate, rate-limit, persist, then broadcast.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::chat_server::Fanout;
use crate::clock::Clock;
use crate::config::ChatLimits;
use crate::directory::Directory;
use crate::error::ChatError;
use crate::models::{validate_body, Attachment, ChatMessage, MessageKind, NewMessage, RoomKey};
use crate::notifications::{NotificationDraft, Notifications};
use crate::protocol::{MessageRef, ReceivedMessage, ServerEvent};
use crate::store::MessageStore;

/// Notification type raised for the receiver of a chat message.
pub const CHAT_NOTIFICATION_KIND: &str = "chat-message";

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub tenant_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub task_id: String,
    pub body: String,
    /// Client correlation token, echoed on the room broadcast.
    pub temp_id: Option<String>,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
}

impl SendRequest {
    pub fn text(
        tenant_id: &str,
        sender_id: &str,
        receiver_id: &str,
        task_id: &str,
        body: impl Into<String>,
    ) -> Self {
        SendRequest {
            tenant_id: tenant_id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            task_id: task_id.to_string(),
            body: body.into(),
            temp_id: None,
            kind: MessageKind::Text,
            attachments: Vec::new(),
        }
    }

    pub fn with_temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }
}

type SenderKey = (String, String);

pub struct ChatDelivery {
    messages: Arc<dyn MessageStore>,
    notifications: Arc<Notifications>,
    directory: Arc<dyn Directory>,
    fanout: Arc<dyn Fanout>,
    clock: Arc<dyn Clock>,
    limits: ChatLimits,
    /// Serialises the count-then-append of one sender.
    gates: DashMap<SenderKey, Arc<Mutex<()>>>,
}

impl ChatDelivery {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        notifications: Arc<Notifications>,
        directory: Arc<dyn Directory>,
        fanout: Arc<dyn Fanout>,
        clock: Arc<dyn Clock>,
        limits: ChatLimits,
    ) -> Self {
        ChatDelivery {
            messages,
            notifications,
            directory,
            fanout,
            clock,
            limits,
            gates: DashMap::new(),
        }
    }

    pub async fn send(&self, req: SendRequest) -> Result<ChatMessage, ChatError> {
        validate_body(&req.body, self.limits.max_body_len)?;
        let room = RoomKey::task(&req.tenant_id, &req.task_id)?;

        let key = (req.tenant_id.clone(), req.sender_id.clone());
        let gate = self.gates.entry(key.clone()).or_default().clone();
        let persisted = {
            let _held = gate.lock().await;
            self.persist(&req).await
        };
        drop(gate);
        self.gates.remove_if(&key, |_, g| Arc::strong_count(g) == 1);
        let message = persisted?;

        debug!("message {} persisted in {} by {}", message.id, room, message.sender_id);
        self.fanout.broadcast(
            room,
            ServerEvent::MessageReceived(ReceivedMessage {
                message: message.clone(),
                temp_id: req.temp_id,
            }),
        );
        self.fanout.broadcast(
            RoomKey::notif(&message.tenant_id, &message.sender_id),
            ServerEvent::MessageDelivered(MessageRef {
                message_id: message.id.clone(),
                task_id: Some(message.task_id.clone()),
            }),
        );
        self.notify_receiver(&message).await;
        Ok(message)
    }

    async fn persist(&self, req: &SendRequest) -> Result<ChatMessage, ChatError> {
        let since = self.limits.window_start(self.clock.now());
        let recent = self
            .messages
            .count_sent_since(&req.tenant_id, &req.sender_id, since)
            .await?;
        if recent >= u64::from(self.limits.rate_limit) {
            info!(
                "rate limit hit by {} (tenant {}): {} in window",
                req.sender_id, req.tenant_id, recent
            );
            return Err(ChatError::RateLimitExceeded {
                limit: self.limits.rate_limit,
                window_secs: self.limits.rate_window.as_secs(),
            });
        }

        let sender_name = match self.directory.display_name(&req.sender_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!("no display name for {}: {e}", req.sender_id);
                req.sender_id.clone()
            }
        };

        let message = self
            .messages
            .append(NewMessage {
                tenant_id: req.tenant_id.clone(),
                task_id: req.task_id.trim().to_string(),
                sender_id: req.sender_id.clone(),
                sender_name,
                receiver_id: req.receiver_id.clone(),
                body: req.body.clone(),
                kind: req.kind,
                attachments: req.attachments.clone(),
            })
            .await?;
        Ok(message)
    }

    async fn notify_receiver(&self, message: &ChatMessage) {
        if message.receiver_id.is_empty() || message.receiver_id == message.sender_id {
            return;
        }
        let draft = NotificationDraft::new(
            CHAT_NOTIFICATION_KIND,
            format!("New message from {}", message.sender_name),
            preview(&message.body),
        );
        if let Err(e) = self
            .notifications
            .notify_user(&message.tenant_id, &message.receiver_id, draft)
            .await
        {
            warn!(
                "message {} sent but notifying {} failed: {e}",
                message.id, message.receiver_id
            );
        }
    }

    /// Flags everything addressed to `user_id` in the room as read and tells
    /// the room which messages were seen.
    pub async fn mark_read(
        &self,
        tenant_id: &str,
        task_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, ChatError> {
        let room = RoomKey::task(tenant_id, task_id)?;
        let task_id = task_id.trim();
        let seen = self.messages.mark_read(tenant_id, task_id, user_id).await?;
        for id in &seen {
            self.fanout.broadcast(
                room.clone(),
                ServerEvent::MessageSeen(MessageRef {
                    message_id: id.clone(),
                    task_id: Some(task_id.to_string()),
                }),
            );
        }
        Ok(seen)
    }

    /// Only the original sender may edit.
    pub async fn edit(
        &self,
        tenant_id: &str,
        user_id: &str,
        message_id: &str,
        new_body: &str,
    ) -> Result<ChatMessage, ChatError> {
        validate_body(new_body, self.limits.max_body_len)?;
        let current = self.owned_live(tenant_id, user_id, message_id).await?;
        let edited = self
            .messages
            .edit(tenant_id, message_id, new_body)
            .await?
            .ok_or(ChatError::NotFound)?;
        self.fanout.broadcast(
            RoomKey::task(tenant_id, &current.task_id)?,
            ServerEvent::MessageEdited(edited.clone()),
        );
        Ok(edited)
    }

    /// Soft delete; only the original sender may delete.
    pub async fn delete(
        &self,
        tenant_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), ChatError> {
        let current = self.owned_live(tenant_id, user_id, message_id).await?;
        if !self.messages.soft_delete(tenant_id, message_id).await? {
            return Err(ChatError::NotFound);
        }
        self.fanout.broadcast(
            RoomKey::task(tenant_id, &current.task_id)?,
            ServerEvent::MessageDeleted(MessageRef {
                message_id: message_id.to_string(),
                task_id: Some(current.task_id),
            }),
        );
        Ok(())
    }

    async fn owned_live(
        &self,
        tenant_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<ChatMessage, ChatError> {
        let message = match self.messages.get(tenant_id, message_id).await? {
            Some(m) if !m.deleted => m,
            _ => return Err(ChatError::NotFound),
        };
        if message.sender_id != user_id {
            return Err(ChatError::Forbidden("only the sender may change a message".into()));
        }
        Ok(message)
    }

    pub async fn list_by_room(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        RoomKey::task(tenant_id, task_id)?;
        Ok(self.messages.list_by_room(tenant_id, task_id.trim()).await?)
    }

    pub async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        task_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        Ok(self.messages.search(tenant_id, query, task_id).await?)
    }

    /// Direct lookup, including soft-deleted rows.
    pub async fn get(&self, tenant_id: &str, message_id: &str) -> Result<ChatMessage, ChatError> {
        self.messages
            .get(tenant_id, message_id)
            .await?
            .ok_or(ChatError::NotFound)
    }
}

fn preview(body: &str) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::clock::ManualClock;
    use crate::directory::StaticDirectory;
    use crate::store::{MemoryMessageStore, MemoryNotificationStore, NotificationStore};
    use crate::test_support::{manual_clock, FailingStore, RecordingFanout};
    use chrono::Duration;

    struct Harness {
        delivery: Arc<ChatDelivery>,
        notifications: Arc<Notifications>,
        fanout: Arc<RecordingFanout>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(
        messages: Option<Arc<dyn MessageStore>>,
        notification_store: Option<Arc<dyn NotificationStore>>,
        limits: ChatLimits,
    ) -> Harness {
        let clock = manual_clock();
        let fanout = Arc::new(RecordingFanout::default());
        let directory = Arc::new(
            StaticDirectory::new()
                .with_user("s", "t", "Sam", Role::Member)
                .with_user("r", "t", "Ria", Role::Member),
        );
        let messages = messages.unwrap_or_else(|| {
            Arc::new(MemoryMessageStore::new(clock.clone(), limits.max_body_len))
        });
        let notification_store = notification_store
            .unwrap_or_else(|| Arc::new(MemoryNotificationStore::new(clock.clone())));
        let notifications = Arc::new(Notifications::new(
            notification_store,
            directory.clone(),
            fanout.clone(),
            clock.clone(),
        ));
        let delivery = Arc::new(ChatDelivery::new(
            messages,
            notifications.clone(),
            directory,
            fanout.clone(),
            clock.clone(),
            limits,
        ));
        Harness {
            delivery,
            notifications,
            fanout,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(None, None, ChatLimits::default())
    }

    fn task(id: &str) -> RoomKey {
        RoomKey::task("t", id).unwrap()
    }

    #[tokio::test]
    async fn basic_send_persists_then_broadcasts() {
        let h = harness();
        let sent = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "hello").with_temp_id("tmp-1"))
            .await
            .unwrap();
        assert_eq!(sent.sender_name, "Sam");

        let history = h.delivery.list_by_room("t", "42").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
        assert!(history[0].delivered);
        assert!(!history[0].read);

        let room = h.fanout.to_room(&task("42"));
        assert_eq!(
            room,
            vec![ServerEvent::MessageReceived(ReceivedMessage {
                message: sent.clone(),
                temp_id: Some("tmp-1".into()),
            })]
        );
        let own = h.fanout.to_room(&RoomKey::notif("t", "s"));
        assert_eq!(
            own,
            vec![ServerEvent::MessageDelivered(MessageRef {
                message_id: sent.id.clone(),
                task_id: Some("42".into()),
            })]
        );

        let inbox = h.notifications.list("t", "r", true).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, CHAT_NOTIFICATION_KIND);
        assert_eq!(inbox[0].title, "New message from Sam");
        assert_eq!(h.fanout.to_room(&RoomKey::notif("t", "r")).len(), 1);
    }

    #[tokio::test]
    async fn blank_bodies_are_rejected_without_side_effects() {
        let h = harness();
        let err = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "   "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EMPTY_MESSAGE");
        assert!(h.delivery.list_by_room("t", "42").await.unwrap().is_empty());
        assert!(h.fanout.take().is_empty());
    }

    #[tokio::test]
    async fn oversized_bodies_and_bad_rooms_are_rejected() {
        let h = harness();
        let long = "x".repeat(1001);
        let err = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", long))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MESSAGE_TOO_LONG");

        let exact = "x".repeat(1000);
        assert!(h.delivery.send(SendRequest::text("t", "s", "r", "42", exact)).await.is_ok());

        let err = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "../42", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ROOM_KEY");
    }

    #[tokio::test]
    async fn rate_limit_is_a_sliding_window() {
        let h = harness();
        for i in 0..60 {
            h.delivery
                .send(SendRequest::text("t", "s", "r", "42", format!("m{i}")))
                .await
                .unwrap();
        }
        let err = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "one too many"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RateLimitExceeded { limit: 60, window_secs: 60 }));

        // A second later the burst is still inside the window.
        h.clock.advance(Duration::seconds(1));
        assert!(h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "still too soon"))
            .await
            .is_err());

        // Once the window slides past the oldest message, one more fits.
        h.clock.advance(Duration::seconds(59));
        assert!(h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "now"))
            .await
            .is_ok());

        // Other senders were never affected.
        assert!(h
            .delivery
            .send(SendRequest::text("t", "r", "s", "42", "reply"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn windows_longer_than_the_calendar_count_everything() {
        let limits = ChatLimits {
            rate_limit: 2,
            rate_window: std::time::Duration::from_secs(100_000_000_000_000),
            ..ChatLimits::default()
        };
        let h = harness_with(None, None, limits);
        for body in ["one", "two"] {
            h.delivery
                .send(SendRequest::text("t", "s", "r", "42", body))
                .await
                .unwrap();
        }
        h.clock.advance(Duration::days(365));
        let err = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "three"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RateLimitExceeded { limit: 2, .. }));
    }

    #[tokio::test]
    async fn concurrent_sends_cannot_both_take_the_last_slot() {
        let limits = ChatLimits {
            rate_limit: 1,
            ..ChatLimits::default()
        };
        let h = harness_with(None, None, limits);
        let a = h.delivery.clone();
        let b = h.delivery.clone();
        let (x, y) = tokio::join!(
            tokio::spawn(async move { a.send(SendRequest::text("t", "s", "r", "42", "a")).await }),
            tokio::spawn(async move { b.send(SendRequest::text("t", "s", "r", "42", "b")).await }),
        );
        let results = [x.unwrap(), y.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(h.delivery.gates.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_aborts_before_broadcast() {
        let h = harness_with(Some(Arc::new(FailingStore)), None, ChatLimits::default());
        let err = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::StorageUnavailable));
        assert!(h.fanout.take().is_empty());
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_the_send() {
        let h = harness_with(None, Some(Arc::new(FailingStore)), ChatLimits::default());
        let sent = h
            .delivery
            .send(SendRequest::text("t", "s", "r", "42", "hello"))
            .await
            .unwrap();
        assert_eq!(h.delivery.list_by_room("t", "42").await.unwrap(), vec![sent]);
        assert_eq!(h.fanout.to_room(&task("42")).len(), 1);
    }

    #[tokio::test]
    async fn messages_to_yourself_raise_no_notification() {
        let h = harness();
        h.delivery
            .send(SendRequest::text("t", "s", "s", "42", "note to self"))
            .await
            .unwrap();
        assert!(h.notifications.list("t", "s", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_read_announces_each_seen_message() {
        let h = harness();
        let first = h.delivery.send(SendRequest::text("t", "s", "r", "42", "a")).await.unwrap();
        let second = h.delivery.send(SendRequest::text("t", "s", "r", "42", "b")).await.unwrap();
        h.fanout.take();

        let seen = h.delivery.mark_read("t", "42", "r").await.unwrap();
        assert_eq!(seen.len(), 2);
        let events = h.fanout.to_room(&task("42"));
        for id in [&first.id, &second.id] {
            assert!(events.contains(&ServerEvent::MessageSeen(MessageRef {
                message_id: id.clone(),
                task_id: Some("42".into()),
            })));
        }
        assert!(h.delivery.mark_read("t", "42", "r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_sender_may_edit_or_delete() {
        let h = harness();
        let sent = h.delivery.send(SendRequest::text("t", "s", "r", "42", "helo")).await.unwrap();

        let err = h.delivery.edit("t", "r", &sent.id, "hijacked").await.unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        let err = h.delivery.delete("t", "r", &sent.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let edited = h.delivery.edit("t", "s", &sent.id, "hello").await.unwrap();
        assert_eq!(edited.body, "hello");
        assert!(h
            .fanout
            .to_room(&task("42"))
            .contains(&ServerEvent::MessageEdited(edited.clone())));

        h.delivery.delete("t", "s", &sent.id).await.unwrap();
        assert!(h.delivery.list_by_room("t", "42").await.unwrap().is_empty());
        assert!(h.delivery.get("t", &sent.id).await.unwrap().deleted);
        assert!(matches!(
            h.delivery.delete("t", "s", &sent.id).await,
            Err(ChatError::NotFound)
        ));
        assert!(matches!(
            h.delivery.edit("t", "s", "missing", "x").await,
            Err(ChatError::NotFound)
        ));
    }

    #[tokio::test]
    async fn colliding_task_ids_stay_tenant_isolated() {
        let h = harness();
        h.delivery.send(SendRequest::text("t", "s", "r", "7", "ours")).await.unwrap();
        h.delivery.send(SendRequest::text("other", "s", "r", "7", "theirs")).await.unwrap();
        let ours = h.delivery.list_by_room("t", "7").await.unwrap();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].body, "ours");
        assert_eq!(h.fanout.to_room(&RoomKey::task("other", "7").unwrap()).len(), 1);
    }

    #[test]
    fn previews_are_cut_on_char_boundaries() {
        assert_eq!(preview("short"), "short");
        let long = "é".repeat(150);
        let cut = preview(&long);
        assert_eq!(cut.chars().count(), PREVIEW_CHARS + 1);
        assert!(cut.ends_with('…'));
    }
}
