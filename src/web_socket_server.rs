use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, Error, HttpMessage, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::auth::{bearer_token, unauthorized, Identity};
use crate::chat_server::{Broadcast, Connect, Disconnect, Join, Leave};
use crate::delivery::SendRequest;
use crate::error::{AuthError, ChatError};
use crate::models::{MessageKind, RoomKey};
use crate::protocol::{ClientFrame, Rejection, RoomTyping, SendMessageFrame, ServerEvent, UserRef};
use crate::registry::{Outbound, SessionId};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pushes queued for one socket before the hub treats it as dead.
const MAILBOX_CAPACITY: usize = 256;

/// One authenticated socket. The hub writes to it through its mailbox.
pub struct WsSession {
    identity: Identity,
    session_id: Option<SessionId>,
    hb: Instant,
    state: web::Data<AppState>,
}

impl WsSession {
    pub fn new(identity: Identity, state: web::Data<AppState>) -> Self {
        WsSession {
            identity,
            session_id: None,
            hb: Instant::now(),
            state,
        }
    }

    /// Pings every 5s; drops silent clients after 10s and expired tokens
    /// on the next tick.
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!("heartbeat failed for user {}, disconnecting", act.identity.user_id);
                ctx.stop();
                return;
            }
            if act.identity.is_expired(act.state.clock.now()) {
                info!("token of user {} expired mid-session", act.identity.user_id);
                act.push(ctx, &ServerEvent::TokenExpired);
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some(AuthError::Expired.code().to_string()),
                }));
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn push(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(text) => ctx.text(text),
            Err(e) => error!("failed to encode {:?}: {e}", event.kind()),
        }
    }

    fn log_rejection(&self, err: &ChatError) {
        if err.is_client_error() {
            debug!("request from {} rejected: {err}", self.identity.user_id);
        } else {
            warn!("request from {} failed: {err}", self.identity.user_id);
        }
    }

    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, err: &ChatError) {
        self.log_rejection(err);
        self.push(ctx, &ServerEvent::Error(Rejection::from_error(None, err)));
    }

    fn task_room(&self, task_id: &str) -> Result<RoomKey, ChatError> {
        Ok(RoomKey::task(&self.identity.tenant_id, task_id)?)
    }

    fn handle_frame(&mut self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session_id) = self.session_id else {
            debug!("frame before registration from {}", self.identity.user_id);
            return;
        };
        match frame {
            ClientFrame::JoinTaskRoom(task_id) => match self.task_room(&task_id) {
                Ok(room) => self.state.chat_server.do_send(Join { session_id, room }),
                Err(e) => self.reject(ctx, &e),
            },
            ClientFrame::LeaveTaskRoom(task_id) => match self.task_room(&task_id) {
                Ok(room) => self.state.chat_server.do_send(Leave { session_id, room }),
                Err(e) => self.reject(ctx, &e),
            },
            ClientFrame::SendMessage(frame) => self.send_message(frame, ctx),
            ClientFrame::Typing(frame) => {
                self.state.chat_server.do_send(Broadcast {
                    room: RoomKey::notif(&self.identity.tenant_id, &frame.receiver_id),
                    event: ServerEvent::Typing(UserRef {
                        user_id: self.identity.user_id.clone(),
                    }),
                    except: None,
                });
            }
            ClientFrame::RoomTyping(task_id) => match self.task_room(&task_id) {
                Ok(room) => self.state.chat_server.do_send(Broadcast {
                    room,
                    event: ServerEvent::RoomTyping(RoomTyping {
                        task_id: task_id.trim().to_string(),
                        user_id: self.identity.user_id.clone(),
                    }),
                    except: Some(session_id),
                }),
                Err(e) => self.reject(ctx, &e),
            },
            ClientFrame::MarkRead(task_id) => {
                let delivery = self.state.delivery.clone();
                let tenant_id = self.identity.tenant_id.clone();
                let user_id = self.identity.user_id.clone();
                async move { delivery.mark_read(&tenant_id, &task_id, &user_id).await }
                    .into_actor(self)
                    .map(|res, act, ctx| {
                        if let Err(e) = res {
                            act.reject(ctx, &e);
                        }
                    })
                    .spawn(ctx);
            }
        }
    }

    fn send_message(&mut self, frame: SendMessageFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let temp_id = frame.temp_id.clone();
        let req = SendRequest {
            tenant_id: self.identity.tenant_id.clone(),
            sender_id: self.identity.user_id.clone(),
            receiver_id: frame.receiver_id,
            task_id: frame.task_id,
            body: frame.message,
            temp_id: frame.temp_id,
            kind: MessageKind::Text,
            attachments: Vec::new(),
        };
        let delivery = self.state.delivery.clone();
        async move { delivery.send(req).await }
            .into_actor(self)
            .map(move |res, act, ctx| {
                if let Err(e) = res {
                    act.log_rejection(&e);
                    act.push(
                        ctx,
                        &ServerEvent::MessageRejected(Rejection::from_error(temp_id, &e)),
                    );
                }
            })
            .spawn(ctx);
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(MAILBOX_CAPACITY);
        self.hb(ctx);

        let outbox = Box::new(ctx.address().recipient::<Outbound>());
        self.state
            .chat_server
            .send(Connect {
                identity: self.identity.clone(),
                outbox,
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(session_id) => act.session_id = Some(session_id),
                    Err(e) => {
                        error!("failed to register user {} with the hub: {e}", act.identity.user_id);
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        if let Some(session_id) = self.session_id.take() {
            self.state.chat_server.do_send(Disconnect { session_id });
        }
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Event(event) => self.push(ctx, &event),
            Outbound::Evict => {
                // The hub already forgot this session.
                self.session_id = None;
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => self.handle_frame(frame, ctx),
                    Err(e) => {
                        debug!("unparseable frame from {}: {e}", self.identity.user_id);
                        self.push(
                            ctx,
                            &ServerEvent::Error(Rejection {
                                temp_id: None,
                                code: "BAD_FRAME".into(),
                                message: e.to_string(),
                            }),
                        );
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                debug!("ignoring binary frame from {}", self.identity.user_id);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("websocket error for {}: {e}", self.identity.user_id);
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// `GET /ws`. The token is verified before the upgrade; a rejected
/// handshake never reaches the hub.
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    // Set by the middleware when an Authorization header was present.
    let verified = req.extensions().get::<Identity>().cloned();
    let identity = match verified {
        Some(identity) => Ok(identity),
        None => match bearer_token(&req) {
            Some(token) => state.verifier.verify(&token),
            None => Err(AuthError::Missing),
        },
    };
    match identity {
        Ok(identity) => ws::start(WsSession::new(identity, state.clone()), &req, stream),
        Err(e) => {
            info!("websocket handshake rejected: {e}");
            Ok(unauthorized(&e))
        }
    }
}
