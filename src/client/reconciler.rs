//! Per-room message view that merges optimistic local sends with server
//! pushes.
//!
//! Every entry is a small state machine: `Pending(correlation)` until the
//! server echoes the correlation back, then `Confirmed(id)`; or `Failed` if
//! the send never made it. Views are kept sorted by `(timestamp, id)`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ChatMessage, MessageKind};
use crate::protocol::{MessageRef, ReceivedMessage, Rejection, ServerEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Pending { correlation: String },
    Confirmed { id: String },
    Failed { correlation: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub state: EntryState,
    pub message: ChatMessage,
}

impl Entry {
    pub fn is_optimistic(&self) -> bool {
        matches!(self.state, EntryState::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, EntryState::Failed { .. })
    }

    fn correlation(&self) -> Option<&str> {
        match &self.state {
            EntryState::Pending { correlation } | EntryState::Failed { correlation, .. } => {
                Some(correlation)
            }
            EntryState::Confirmed { .. } => None,
        }
    }

    fn confirmed_id(&self) -> Option<&str> {
        match &self.state {
            EntryState::Confirmed { id } => Some(id),
            _ => None,
        }
    }
}

/// A message the local user is about to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub tenant_id: String,
    pub task_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub body: String,
}

/// What a server push did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// Replaced a local optimistic entry.
    Reconciled,
    Updated,
    Removed,
    Duplicate,
    /// The room is not joined; nothing was stored.
    ForeignRoom,
    /// The push referenced something this view does not hold, or is not a
    /// message event.
    Ignored,
}

/// Task ids are trimmed the same way the server builds room keys.
fn room(task_id: &str) -> &str {
    task_id.trim()
}

#[derive(Debug, Default)]
pub struct Reconciler {
    rooms: HashMap<String, Vec<Entry>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, task_id: &str) {
        self.rooms.entry(room(task_id).to_string()).or_default();
    }

    /// Drops the room's view entirely.
    pub fn leave(&mut self, task_id: &str) {
        self.rooms.remove(room(task_id));
    }

    pub fn is_joined(&self, task_id: &str) -> bool {
        self.rooms.contains_key(room(task_id))
    }

    pub fn joined(&self) -> impl Iterator<Item = &str> {
        self.rooms.keys().map(String::as_str)
    }

    pub fn view(&self, task_id: &str) -> &[Entry] {
        self.rooms.get(room(task_id)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Seeds a joined room with fetched history.
    pub fn load(&mut self, task_id: &str, history: Vec<ChatMessage>) {
        if !self.is_joined(task_id) {
            return;
        }
        let key = room(task_id);
        for message in history.into_iter().filter(|m| room(&m.task_id) == key) {
            self.confirm(message, None);
        }
    }

    /// Inserts an optimistic entry and returns its correlation token, or
    /// `None` when the room is not joined.
    pub fn stage(&mut self, draft: Outgoing, now: DateTime<Utc>) -> Option<String> {
        let task_id = room(&draft.task_id).to_string();
        let view = self.rooms.get_mut(&task_id)?;
        let correlation = format!("tmp-{}", Uuid::new_v4());
        view.push(Entry {
            state: EntryState::Pending {
                correlation: correlation.clone(),
            },
            message: ChatMessage {
                id: correlation.clone(),
                tenant_id: draft.tenant_id,
                task_id,
                sender_id: draft.sender_id,
                sender_name: draft.sender_name,
                receiver_id: draft.receiver_id,
                body: draft.body,
                kind: MessageKind::Text,
                attachments: Vec::new(),
                timestamp: now,
                delivered: false,
                delivered_at: None,
                read: false,
                read_at: None,
                edited: false,
                edit_history: Vec::new(),
                deleted: false,
                deleted_at: None,
            },
        });
        sort(view);
        Some(correlation)
    }

    /// Applies an authoritative message, matching it to a local entry by
    /// correlation token first and by id second.
    pub fn confirm(&mut self, message: ChatMessage, correlation: Option<&str>) -> Applied {
        let Some(view) = self.rooms.get_mut(room(&message.task_id)) else {
            return Applied::ForeignRoom;
        };
        let local = correlation.and_then(|c| view.iter().position(|e| e.correlation() == Some(c)));

        if view.iter().any(|e| e.confirmed_id() == Some(message.id.as_str())) {
            // Already confirmed; a leftover optimistic twin must not linger.
            if let Some(i) = local {
                view.remove(i);
            }
            return Applied::Duplicate;
        }

        let state = EntryState::Confirmed {
            id: message.id.clone(),
        };
        let applied = match local {
            Some(i) => {
                view[i] = Entry { state, message };
                Applied::Reconciled
            }
            None => {
                view.push(Entry { state, message });
                Applied::Inserted
            }
        };
        sort(view);
        applied
    }

    /// Marks a local entry failed, keeping its content for retry.
    pub fn fail(&mut self, correlation: &str, reason: impl Into<String>) -> bool {
        match self.find_local(correlation) {
            Some(entry) => {
                entry.state = EntryState::Failed {
                    correlation: correlation.to_string(),
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    /// Moves a failed entry back to pending and returns it for resending.
    pub fn retry(&mut self, correlation: &str) -> Option<Entry> {
        let entry = self.find_local(correlation)?;
        if !entry.is_failed() {
            return None;
        }
        entry.state = EntryState::Pending {
            correlation: correlation.to_string(),
        };
        Some(entry.clone())
    }

    /// Removes a local (pending or failed) entry.
    pub fn discard(&mut self, correlation: &str) -> Option<Entry> {
        for view in self.rooms.values_mut() {
            if let Some(i) = view.iter().position(|e| e.correlation() == Some(correlation)) {
                return Some(view.remove(i));
            }
        }
        None
    }

    fn find_local(&mut self, correlation: &str) -> Option<&mut Entry> {
        self.rooms
            .values_mut()
            .flat_map(|view| view.iter_mut())
            .find(|e| e.correlation() == Some(correlation))
    }

    fn find_confirmed(&mut self, task_id: Option<&str>, id: &str) -> Option<&mut Entry> {
        self.rooms
            .iter_mut()
            .filter(|(key, _)| task_id.map_or(true, |t| room(t) == key.as_str()))
            .flat_map(|(_, view)| view.iter_mut())
            .find(|e| e.confirmed_id() == Some(id))
    }

    /// Folds one server push into the views.
    pub fn apply(&mut self, event: &ServerEvent) -> Applied {
        match event {
            ServerEvent::MessageReceived(ReceivedMessage { message, temp_id }) => {
                self.confirm(message.clone(), temp_id.as_deref())
            }
            ServerEvent::MessageEdited(message) => {
                if !self.is_joined(&message.task_id) {
                    return Applied::ForeignRoom;
                }
                match self.find_confirmed(Some(&message.task_id), &message.id) {
                    Some(entry) => {
                        entry.message = message.clone();
                        Applied::Updated
                    }
                    None => Applied::Ignored,
                }
            }
            ServerEvent::MessageSeen(MessageRef {
                message_id,
                task_id,
            }) => match self.find_confirmed(task_id.as_deref(), message_id) {
                Some(entry) => {
                    entry.message.read = true;
                    Applied::Updated
                }
                None => Applied::Ignored,
            },
            ServerEvent::MessageDeleted(MessageRef {
                message_id,
                task_id,
            }) => {
                for (key, view) in self.rooms.iter_mut() {
                    if task_id.as_deref().is_some_and(|t| room(t) != key.as_str()) {
                        continue;
                    }
                    if let Some(i) = view
                        .iter()
                        .position(|e| e.confirmed_id() == Some(message_id.as_str()))
                    {
                        view.remove(i);
                        return Applied::Removed;
                    }
                }
                Applied::Ignored
            }
            ServerEvent::MessageRejected(Rejection {
                temp_id: Some(correlation),
                message,
                ..
            }) => {
                if self.fail(correlation, message.clone()) {
                    Applied::Updated
                } else {
                    Applied::Ignored
                }
            }
            _ => Applied::Ignored,
        }
    }
}

fn sort(view: &mut [Entry]) {
    view.sort_by(|a, b| {
        a.message
            .timestamp
            .cmp(&b.message.timestamp)
            .then_with(|| a.message.id.cmp(&b.message.id))
    });
}
