use actix::prelude::*;
use log::{debug, info};
use serde::Serialize;

use crate::auth::Identity;
use crate::models::RoomKey;
use crate::protocol::{ServerEvent, UserRef};
use crate::registry::{ConnectionRegistry, Outbox, Presence, SessionId};
use crate::rooms::RoomIndex;

/// Registers a verified connection. Every session is subscribed to its
/// user's personal channel; admin-capable sessions also get the tenant's
/// admin channel.
#[derive(Message)]
#[rtype(result = "SessionId")]
pub struct Connect {
    pub identity: Identity,
    pub outbox: Box<dyn Outbox>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub session_id: SessionId,
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct Join {
    pub session_id: SessionId,
    pub room: RoomKey,
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct Leave {
    pub session_id: SessionId,
    pub room: RoomKey,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Broadcast {
    pub room: RoomKey,
    pub event: ServerEvent,
    pub except: Option<SessionId>,
}

#[derive(Message)]
#[rtype(result = "HubStats")]
pub struct GetStats {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, MessageResponse)]
pub struct HubStats {
    pub sessions: usize,
    pub users: usize,
    pub rooms: usize,
}

/// Something that can push an event to a room without waiting on the
/// recipients.
pub trait Fanout: Send + Sync {
    fn broadcast(&self, room: RoomKey, event: ServerEvent);
}

impl Fanout for Addr<ChatServer> {
    fn broadcast(&self, room: RoomKey, event: ServerEvent) {
        self.do_send(Broadcast {
            room,
            event,
            except: None,
        });
    }
}

/// Owns the connection registry and room index. Joins, leaves, broadcasts
/// and closes for every connection are serialised through this actor.
///
/// A session joining while a broadcast is queued sees the broadcast only if
/// its `Join` reached the mailbox first.
#[derive(Default)]
pub struct ChatServer {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
}

impl ChatServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&mut self, session_id: SessionId, room: RoomKey) -> bool {
        if !self.registry.record_join(session_id, room.clone()) {
            return false;
        }
        self.rooms.join(room, session_id);
        true
    }

    fn close(&mut self, session_id: SessionId) {
        let Some(closed) = self.registry.close(session_id) else {
            return;
        };
        for room in &closed.rooms {
            self.rooms.leave(room, session_id);
        }
        closed.outbox.evict();
        info!(
            "user {} (tenant {}) session {} closed, {} sessions in {} rooms remain",
            closed.identity.user_id,
            closed.identity.tenant_id,
            session_id,
            self.registry.len(),
            self.rooms.len()
        );
        if closed.went_offline {
            self.announce(
                &closed.identity.tenant_id,
                ServerEvent::UserOffline(UserRef {
                    user_id: closed.identity.user_id.clone(),
                }),
                None,
            );
        }
    }

    /// Best-effort presence push to every session of a tenant.
    fn announce(&self, tenant_id: &str, event: ServerEvent, except: Option<SessionId>) {
        for session in self.registry.tenant_sessions(tenant_id) {
            if Some(session) == except {
                continue;
            }
            if let Err(e) = self.registry.deliver(session, event.clone()) {
                debug!("presence update to session {session} dropped: {e}");
            }
        }
    }
}

impl Actor for ChatServer {
    type Context = Context<Self>;
}

impl Handler<Connect> for ChatServer {
    type Result = SessionId;

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) -> Self::Result {
        let identity = msg.identity;
        let (session_id, presence) = self.registry.register(identity.clone(), msg.outbox);
        self.join(session_id, RoomKey::notif(&identity.tenant_id, &identity.user_id));
        if identity.role.is_admin_capable() {
            self.join(session_id, RoomKey::notif_admin(&identity.tenant_id));
        }
        info!(
            "user {} (tenant {}) connected as session {}",
            identity.user_id, identity.tenant_id, session_id
        );
        if presence == Presence::CameOnline {
            self.announce(
                &identity.tenant_id,
                ServerEvent::UserOnline(UserRef {
                    user_id: identity.user_id.clone(),
                }),
                Some(session_id),
            );
        }
        session_id
    }
}

impl Handler<Disconnect> for ChatServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        self.close(msg.session_id);
    }
}

impl Handler<Join> for ChatServer {
    type Result = bool;

    fn handle(&mut self, msg: Join, _: &mut Context<Self>) -> Self::Result {
        let Some(session) = self.registry.get(msg.session_id) else {
            return false;
        };
        // Rooms never span tenants.
        if session.identity.tenant_id != msg.room.tenant_id() {
            return false;
        }
        debug!("session {} joined {}", msg.session_id, msg.room);
        self.join(msg.session_id, msg.room)
    }
}

impl Handler<Leave> for ChatServer {
    type Result = bool;

    fn handle(&mut self, msg: Leave, _: &mut Context<Self>) -> Self::Result {
        self.registry.record_leave(msg.session_id, &msg.room);
        self.rooms.leave(&msg.room, msg.session_id)
    }
}

impl Handler<Broadcast> for ChatServer {
    type Result = ();

    fn handle(&mut self, msg: Broadcast, ctx: &mut Context<Self>) {
        let report = self
            .rooms
            .broadcast(&self.registry, &msg.room, &msg.event, msg.except);
        for session_id in report.failed {
            ctx.notify(Disconnect { session_id });
        }
    }
}

impl Handler<GetStats> for ChatServer {
    type Result = HubStats;

    fn handle(&mut self, msg: GetStats, _: &mut Context<Self>) -> Self::Result {
        let tenant = msg.tenant_id.as_str();
        HubStats {
            sessions: self.registry.tenant_sessions(tenant).len(),
            users: self.registry.tenant_user_count(tenant),
            rooms: self.rooms.tenant_len(tenant),
        }
    }
}
