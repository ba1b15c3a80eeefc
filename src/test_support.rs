//! Doubles shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::chat_server::Fanout;
use crate::clock::ManualClock;
use crate::error::StoreError;
use crate::models::{ChatMessage, NewMessage, Notification, RoomKey};
use crate::protocol::ServerEvent;
use crate::store::{MessageStore, NotificationStore};

pub(crate) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub(crate) fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start()))
}

/// Records every broadcast instead of delivering it.
#[derive(Default)]
pub(crate) struct RecordingFanout {
    sent: Mutex<Vec<(RoomKey, ServerEvent)>>,
}

impl RecordingFanout {
    pub(crate) fn take(&self) -> Vec<(RoomKey, ServerEvent)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub(crate) fn to_room(&self, room: &RoomKey) -> Vec<ServerEvent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == room)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl Fanout for RecordingFanout {
    fn broadcast(&self, room: RoomKey, event: ServerEvent) {
        self.sent.lock().unwrap().push((room, event));
    }
}

/// A message and notification store whose backend is down.
pub(crate) struct FailingStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

#[async_trait]
impl MessageStore for FailingStore {
    async fn append(&self, _: NewMessage) -> Result<ChatMessage, StoreError> {
        Err(down())
    }

    async fn get(&self, _: &str, _: &str) -> Result<Option<ChatMessage>, StoreError> {
        Err(down())
    }

    async fn list_by_room(&self, _: &str, _: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Err(down())
    }

    async fn mark_read(&self, _: &str, _: &str, _: &str) -> Result<Vec<String>, StoreError> {
        Err(down())
    }

    async fn edit(&self, _: &str, _: &str, _: &str) -> Result<Option<ChatMessage>, StoreError> {
        Err(down())
    }

    async fn soft_delete(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn search(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        Err(down())
    }

    // Counting succeeds so a send gets as far as the append.
    async fn count_sent_since(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn purge_expired(&self, _: DateTime<Utc>) -> Result<u64, StoreError> {
        Err(down())
    }
}

#[async_trait]
impl NotificationStore for FailingStore {
    async fn insert_many(&self, _: &[Notification]) -> Result<(), StoreError> {
        Err(down())
    }

    async fn get(&self, _: &str, _: &str) -> Result<Option<Notification>, StoreError> {
        Err(down())
    }

    async fn list_for_user(&self, _: &str, _: &str, _: bool) -> Result<Vec<Notification>, StoreError> {
        Err(down())
    }

    async fn mark_read(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn mark_all_read(&self, _: &str, _: &str) -> Result<u64, StoreError> {
        Err(down())
    }
}
