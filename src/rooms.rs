//! Room membership: which live sessions listen on which room key.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::models::RoomKey;
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionRegistry, SessionId};

/// Outcome of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions whose transport refused the write; the caller closes them.
    pub failed: Vec<SessionId>,
}

#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: HashMap<RoomKey, HashSet<SessionId>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the session was already a member.
    pub fn join(&mut self, room: RoomKey, session: SessionId) -> bool {
        self.rooms.entry(room).or_default().insert(session)
    }

    /// Returns `false` if the session was not a member.
    pub fn leave(&mut self, room: &RoomKey, session: SessionId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&session);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    /// Number of non-empty rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn tenant_len(&self, tenant_id: &str) -> usize {
        self.rooms.keys().filter(|room| room.tenant_id() == tenant_id).count()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Pushes `event` to every member except `except`. A failed write is
    /// logged and reported; it never stops delivery to the other members.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        room: &RoomKey,
        event: &ServerEvent,
        except: Option<SessionId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(members) = self.rooms.get(room) else {
            return report;
        };
        for &session in members {
            if Some(session) == except {
                continue;
            }
            match registry.deliver(session, event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("dropping {:?} for session {} in {}: {}", event.kind(), session, room, e);
                    report.failed.push(session);
                }
            }
        }
        report
    }
}
