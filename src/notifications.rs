//! Persist-then-push notifications.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error};

use crate::chat_server::Fanout;
use crate::clock::Clock;
use crate::directory::Directory;
use crate::error::ChatError;
use crate::models::{Notification, NotificationEvent, RoomKey};
use crate::protocol::ServerEvent;
use crate::store::{new_id, NotificationStore};

/// Content of a notification before it is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    pub kind: String,
    pub title: String,
    pub body: String,
}

impl NotificationDraft {
    pub fn new(kind: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        NotificationDraft {
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
        }
    }
}

pub struct Notifications {
    store: Arc<dyn NotificationStore>,
    directory: Arc<dyn Directory>,
    fanout: Arc<dyn Fanout>,
    clock: Arc<dyn Clock>,
}

impl Notifications {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        directory: Arc<dyn Directory>,
        fanout: Arc<dyn Fanout>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Notifications {
            store,
            directory,
            fanout,
            clock,
        }
    }

    fn row(&self, tenant_id: &str, recipient_id: &str, draft: &NotificationDraft) -> Notification {
        Notification {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            recipient_id: recipient_id.to_string(),
            kind: draft.kind.clone(),
            title: draft.title.clone(),
            body: draft.body.clone(),
            is_read: false,
            read_at: None,
            created_at: self.clock.now(),
        }
    }

    fn push(&self, row: &Notification) {
        self.fanout.broadcast(
            RoomKey::notif(&row.tenant_id, &row.recipient_id),
            ServerEvent::NotificationNew(NotificationEvent::from(row)),
        );
    }

    /// Stores one notification for `user_id` and pushes it to their personal
    /// channel.
    pub async fn notify_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        draft: NotificationDraft,
    ) -> Result<Notification, ChatError> {
        let row = self.row(tenant_id, user_id, &draft);
        self.store.insert_many(std::slice::from_ref(&row)).await?;
        self.push(&row);
        debug!("notified {user_id} (tenant {tenant_id}): {}", row.kind);
        Ok(row)
    }

    /// Stores one row per admin-capable user, pushes each to its owner, then
    /// pushes the shared content once to the tenant's admin dashboard room.
    pub async fn notify_admins(
        &self,
        tenant_id: &str,
        draft: NotificationDraft,
    ) -> Result<Vec<Notification>, ChatError> {
        let admins: BTreeSet<String> = self
            .directory
            .admin_capable_users(tenant_id)
            .await
            .map_err(|e| {
                error!("admin lookup for tenant {tenant_id} failed: {e}");
                ChatError::StorageUnavailable
            })?
            .into_iter()
            .collect();
        if admins.is_empty() {
            debug!("tenant {tenant_id} has no admin-capable users; {} dropped", draft.kind);
            return Ok(Vec::new());
        }

        let rows: Vec<Notification> = admins
            .iter()
            .map(|admin| self.row(tenant_id, admin, &draft))
            .collect();
        self.store.insert_many(&rows).await?;
        for row in &rows {
            self.push(row);
        }
        // Same content as every personal push, minus per-row addressing.
        let aggregate = NotificationEvent::from(&rows[0]).aggregate();
        self.fanout.broadcast(
            RoomKey::notif_admin(tenant_id),
            ServerEvent::NotificationNew(aggregate),
        );
        Ok(rows)
    }

    /// Idempotent. `NotFound` when no such notification exists for the tenant.
    pub async fn mark_read(&self, tenant_id: &str, notification_id: &str) -> Result<(), ChatError> {
        if self.store.mark_read(tenant_id, notification_id).await? {
            Ok(())
        } else {
            Err(ChatError::NotFound)
        }
    }

    /// Returns how many rows were flipped; zero on a repeat call.
    pub async fn mark_all_read(&self, tenant_id: &str, user_id: &str) -> Result<u64, ChatError> {
        Ok(self.store.mark_all_read(tenant_id, user_id).await?)
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, ChatError> {
        Ok(self.store.list_for_user(tenant_id, user_id, unread_only).await?)
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Notification, ChatError> {
        self.store.get(tenant_id, id).await?.ok_or(ChatError::NotFound)
    }
}
