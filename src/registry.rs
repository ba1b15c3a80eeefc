//! Live, authenticated connection sessions. A user may hold several at once.

use std::collections::{HashMap, HashSet};
use std::fmt;

use actix::prelude::*;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;
use crate::models::RoomKey;
use crate::protocol::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, MessageResponse)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("session mailbox is full")]
    Full,

    #[error("session is closed")]
    Closed,
}

/// What a connection actor receives from the hub.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub enum Outbound {
    Event(ServerEvent),
    /// The hub dropped this session; the transport should close.
    Evict,
}

/// The write half of a session as seen by the registry.
pub trait Outbox: Send {
    /// Queues an event without blocking. A full or closed queue is a
    /// failure for this session only.
    fn push(&self, event: ServerEvent) -> Result<(), TransportError>;

    /// Asks the transport to shut down. Best-effort.
    fn evict(&self) {}
}

impl Outbox for Recipient<Outbound> {
    fn push(&self, event: ServerEvent) -> Result<(), TransportError> {
        self.try_send(Outbound::Event(event)).map_err(|e| match e {
            SendError::Full(_) => TransportError::Full,
            SendError::Closed(_) => TransportError::Closed,
        })
    }

    fn evict(&self) {
        // Bypasses the mailbox bound so a saturated session still learns it is gone.
        self.do_send(Outbound::Evict);
    }
}

/// In-process subscribers (and tests) can listen on a plain channel.
impl Outbox for mpsc::UnboundedSender<ServerEvent> {
    fn push(&self, event: ServerEvent) -> Result<(), TransportError> {
        self.send(event).map_err(|_| TransportError::Closed)
    }
}

pub struct Session {
    pub id: SessionId,
    pub identity: Identity,
    outbox: Box<dyn Outbox>,
    rooms: HashSet<RoomKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// First live session for this user.
    CameOnline,
    AlreadyOnline,
}

/// What remained of a session when it was closed.
pub struct ClosedSession {
    pub identity: Identity,
    pub rooms: Vec<RoomKey>,
    /// True when this was the user's last live session.
    pub went_offline: bool,
    pub outbox: Box<dyn Outbox>,
}

type UserKey = (String, String);

fn user_key(identity: &Identity) -> UserKey {
    (identity.tenant_id.clone(), identity.user_id.clone())
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<SessionId, Session>,
    users: HashMap<UserKey, HashSet<SessionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session for an already verified identity.
    pub fn register(&mut self, identity: Identity, outbox: Box<dyn Outbox>) -> (SessionId, Presence) {
        let id = SessionId::new();
        let live = self.users.entry(user_key(&identity)).or_default();
        let presence = if live.is_empty() {
            Presence::CameOnline
        } else {
            Presence::AlreadyOnline
        };
        live.insert(id);
        log::debug!(
            "session {} registered for user {} (tenant {}), {} live",
            id,
            identity.user_id,
            identity.tenant_id,
            live.len()
        );
        self.sessions.insert(
            id,
            Session {
                id,
                identity,
                outbox,
                rooms: HashSet::new(),
            },
        );
        (id, presence)
    }

    /// Removes a session. Closing an unknown or already closed session
    /// returns `None`.
    pub fn close(&mut self, id: SessionId) -> Option<ClosedSession> {
        let session = self.sessions.remove(&id)?;
        let key = user_key(&session.identity);
        let went_offline = match self.users.get_mut(&key) {
            Some(live) => {
                live.remove(&id);
                if live.is_empty() {
                    self.users.remove(&key);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some(ClosedSession {
            identity: session.identity,
            rooms: session.rooms.into_iter().collect(),
            went_offline,
            outbox: session.outbox,
        })
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Mirrors a room join on the session so close can undo it.
    pub(crate) fn record_join(&mut self, id: SessionId, room: RoomKey) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.rooms.insert(room);
                true
            }
            None => false,
        }
    }

    pub(crate) fn record_leave(&mut self, id: SessionId, room: &RoomKey) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.rooms.remove(room);
        }
    }

    pub fn deliver(&self, id: SessionId, event: ServerEvent) -> Result<(), TransportError> {
        match self.sessions.get(&id) {
            Some(session) => session.outbox.push(event),
            None => Err(TransportError::Closed),
        }
    }

    /// Every live session of a tenant, for tenant-wide presence.
    pub fn tenant_sessions(&self, tenant_id: &str) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.identity.tenant_id == tenant_id)
            .map(|s| s.id)
            .collect()
    }

    /// Online users of one tenant.
    pub fn tenant_user_count(&self, tenant_id: &str) -> usize {
        self.users.keys().filter(|(t, _)| t == tenant_id).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
