//! Consuming side of the chat socket.

pub mod reconciler;
pub mod session;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::debug;

pub use reconciler::{Applied, Entry, EntryState, Outgoing, Reconciler};
pub use session::{
    ClientSession, ConnectError, ConnectionState, Connector, Link, LinkPeer, ReconnectPolicy,
    SessionSignal, WeakSession,
};
pub use transport::WsConnector;

use crate::models::ChatMessage;
use crate::protocol::{ClientFrame, EventKind, SendMessageFrame};

const NOT_CONNECTED: &str = "not connected";

const VIEW_EVENTS: [EventKind; 5] = [
    EventKind::MessageReceived,
    EventKind::MessageEdited,
    EventKind::MessageSeen,
    EventKind::MessageDeleted,
    EventKind::MessageRejected,
];

fn lock(view: &Mutex<Reconciler>) -> MutexGuard<'_, Reconciler> {
    view.lock().unwrap_or_else(|e| e.into_inner())
}

fn send_frame(task_id: &str, receiver_id: &str, body: &str, temp_id: &str) -> ClientFrame {
    ClientFrame::SendMessage(SendMessageFrame {
        message: body.to_string(),
        receiver_id: receiver_id.to_string(),
        task_id: task_id.to_string(),
        temp_id: Some(temp_id.to_string()),
    })
}

/// Who the local user is, stamped onto optimistic entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub tenant_id: String,
    pub user_id: String,
    pub display_name: String,
}

pub struct ChatClient {
    session: ClientSession,
    identity: ClientIdentity,
    view: Arc<Mutex<Reconciler>>,
    installed: AtomicBool,
}

impl ChatClient {
    pub fn new(session: ClientSession, identity: ClientIdentity) -> Self {
        ChatClient {
            session,
            identity,
            view: Arc::new(Mutex::new(Reconciler::new())),
            installed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    fn install(&self) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }
        for kind in VIEW_EVENTS {
            let view = self.view.clone();
            self.session.on(kind, move |event| {
                let applied = lock(&view).apply(event);
                debug!("{kind:?} applied as {applied:?}");
            });
        }
        let view = self.view.clone();
        let session = self.session.downgrade();
        self.session.on_signal(move |signal| {
            if *signal != SessionSignal::Connected {
                return;
            }
            let rooms: Vec<String> = lock(&view).joined().map(str::to_string).collect();
            for room in rooms {
                session.emit(ClientFrame::JoinTaskRoom(room));
            }
        });
    }

    /// Starts the session with `token`. Handlers are installed once per
    /// client lifetime, or again after [`ChatClient::disconnect`].
    pub fn connect(&self, token: impl Into<String>) {
        self.install();
        self.session.connect(token);
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
        self.installed.store(false, Ordering::SeqCst);
    }

    /// Tracks the room locally and asks the server to join it. A room joined
    /// while offline is joined on the next handshake.
    pub fn join_room(&self, task_id: &str) {
        let task_id = task_id.trim();
        lock(&self.view).join(task_id);
        self.session.emit(ClientFrame::JoinTaskRoom(task_id.to_string()));
    }

    pub fn leave_room(&self, task_id: &str) {
        let task_id = task_id.trim();
        lock(&self.view).leave(task_id);
        self.session.emit(ClientFrame::LeaveTaskRoom(task_id.to_string()));
    }

    /// Seeds a joined room with history fetched over REST.
    pub fn load_history(&self, task_id: &str, history: Vec<ChatMessage>) {
        lock(&self.view).load(task_id, history);
    }

    /// Stages an optimistic entry and sends it. Returns the correlation
    /// token, or `None` when the room is not joined. When the frame cannot
    /// be sent the entry is kept as failed.
    pub fn send(&self, task_id: &str, receiver_id: &str, body: &str) -> Option<String> {
        let task_id = task_id.trim();
        let draft = Outgoing {
            tenant_id: self.identity.tenant_id.clone(),
            task_id: task_id.to_string(),
            sender_id: self.identity.user_id.clone(),
            sender_name: self.identity.display_name.clone(),
            receiver_id: receiver_id.to_string(),
            body: body.to_string(),
        };
        let correlation = lock(&self.view).stage(draft, Utc::now())?;
        if !self
            .session
            .emit(send_frame(task_id, receiver_id, body, &correlation))
        {
            lock(&self.view).fail(&correlation, NOT_CONNECTED);
        }
        Some(correlation)
    }

    /// Resends a failed entry under its original correlation token.
    pub fn retry(&self, correlation: &str) -> bool {
        let Some(entry) = lock(&self.view).retry(correlation) else {
            return false;
        };
        let message = &entry.message;
        let frame = send_frame(&message.task_id, &message.receiver_id, &message.body, correlation);
        if self.session.emit(frame) {
            true
        } else {
            lock(&self.view).fail(correlation, NOT_CONNECTED);
            false
        }
    }

    pub fn discard(&self, correlation: &str) -> Option<Entry> {
        lock(&self.view).discard(correlation)
    }

    pub fn mark_read(&self, task_id: &str) -> bool {
        self.session.emit(ClientFrame::MarkRead(task_id.trim().to_string()))
    }

    /// Snapshot of one room's entries in display order.
    pub fn view(&self, task_id: &str) -> Vec<Entry> {
        lock(&self.view).view(task_id).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::models::MessageKind;
    use crate::protocol::{ReceivedMessage, Rejection, ServerEvent};

    #[derive(Default)]
    struct QueuedLinks {
        links: Mutex<VecDeque<Link>>,
    }

    #[async_trait]
    impl Connector for QueuedLinks {
        async fn connect(&self, _token: &str) -> Result<Link, ConnectError> {
            self.links
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ConnectError::Unreachable("no link".into()))
        }
    }

    fn client_with(links: Vec<Link>) -> ChatClient {
        let connector = QueuedLinks {
            links: Mutex::new(links.into()),
        };
        let policy = ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            connect_timeout: Duration::from_millis(200),
            min_stable: Duration::from_secs(60),
        };
        let session = ClientSession::new(Arc::new(connector), policy);
        ChatClient::new(
            session,
            ClientIdentity {
                tenant_id: "t1".into(),
                user_id: "me".into(),
                display_name: "Me".into(),
            },
        )
    }

    async fn connected(client: &ChatClient) {
        let mut rx = client.session().watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("never connected")
        .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    async fn next_frame(peer: &mut LinkPeer) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(5), peer.frames.recv())
            .await
            .expect("no frame")
            .expect("link closed")
    }

    fn echoed(task: &str, body: &str, temp_id: Option<String>) -> ServerEvent {
        ServerEvent::MessageReceived(ReceivedMessage {
            message: ChatMessage {
                id: "m1".into(),
                tenant_id: "t1".into(),
                task_id: task.into(),
                sender_id: "me".into(),
                sender_name: "Me".into(),
                receiver_id: "you".into(),
                body: body.into(),
                kind: MessageKind::Text,
                attachments: Vec::new(),
                timestamp: Utc::now(),
                delivered: true,
                delivered_at: Some(Utc::now()),
                read: false,
                read_at: None,
                edited: false,
                edit_history: Vec::new(),
                deleted: false,
                deleted_at: None,
            },
            temp_id,
        })
    }

    #[tokio::test]
    async fn echoed_send_replaces_the_optimistic_entry() {
        let (link, mut peer) = Link::pair();
        let client = client_with(vec![link]);
        client.connect("token");
        connected(&client).await;

        client.join_room("task-1");
        assert_eq!(
            next_frame(&mut peer).await,
            ClientFrame::JoinTaskRoom("task-1".into())
        );

        let correlation = client.send("task-1", "you", "hello").unwrap();
        assert!(client.view("task-1")[0].is_optimistic());
        match next_frame(&mut peer).await {
            ClientFrame::SendMessage(frame) => {
                assert_eq!(frame.temp_id.as_deref(), Some(correlation.as_str()));
                assert_eq!(frame.message, "hello");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        peer.events
            .send(echoed("task-1", "hello", Some(correlation)))
            .unwrap();
        eventually(|| {
            let view = client.view("task-1");
            view.len() == 1 && view[0].state == EntryState::Confirmed { id: "m1".into() }
        })
        .await;
    }

    #[tokio::test]
    async fn padded_task_ids_are_trimmed_before_they_leave() {
        let (link, mut peer) = Link::pair();
        let client = client_with(vec![link]);
        client.connect("token");
        connected(&client).await;

        client.join_room("  task-1 ");
        assert_eq!(
            next_frame(&mut peer).await,
            ClientFrame::JoinTaskRoom("task-1".into())
        );
        let correlation = client.send("task-1 ", "you", "hi").unwrap();
        match next_frame(&mut peer).await {
            ClientFrame::SendMessage(frame) => assert_eq!(frame.task_id, "task-1"),
            other => panic!("unexpected frame {other:?}"),
        }
        peer.events
            .send(echoed("task-1", "hi", Some(correlation)))
            .unwrap();
        eventually(|| {
            client
                .view(" task-1")
                .first()
                .is_some_and(|e| e.state == EntryState::Confirmed { id: "m1".into() })
        })
        .await;
    }

    #[tokio::test]
    async fn sends_while_offline_fail_and_can_be_retried() {
        let (link, mut peer) = Link::pair();
        let client = client_with(vec![link]);
        client.join_room("task-1");

        let correlation = client.send("task-1", "you", "queued").unwrap();
        assert!(client.view("task-1")[0].is_failed());
        assert!(!client.retry(&correlation));

        client.connect("token");
        connected(&client).await;
        // The offline join is replayed on connect.
        assert_eq!(
            next_frame(&mut peer).await,
            ClientFrame::JoinTaskRoom("task-1".into())
        );

        assert!(client.retry(&correlation));
        assert!(client.view("task-1")[0].is_optimistic());
        assert!(matches!(next_frame(&mut peer).await, ClientFrame::SendMessage(_)));

        assert!(client.discard(&correlation).is_some());
        assert!(client.view("task-1").is_empty());
    }

    #[tokio::test]
    async fn rooms_are_rejoined_after_a_reconnect() {
        let (first, first_peer) = Link::pair();
        let (second, mut second_peer) = Link::pair();
        let client = client_with(vec![first, second]);
        client.join_room("task-1");
        client.join_room("task-2");
        client.connect("token");
        connected(&client).await;

        drop(first_peer);

        let mut rejoined = vec![next_frame(&mut second_peer).await, next_frame(&mut second_peer).await];
        rejoined.sort_by_key(|f| format!("{f:?}"));
        assert_eq!(
            rejoined,
            vec![
                ClientFrame::JoinTaskRoom("task-1".into()),
                ClientFrame::JoinTaskRoom("task-2".into()),
            ]
        );
    }

    #[tokio::test]
    async fn rejections_mark_the_entry_failed() {
        let (link, mut peer) = Link::pair();
        let client = client_with(vec![link]);
        client.join_room("task-1");
        client.connect("token");
        connected(&client).await;
        next_frame(&mut peer).await;

        let correlation = client.send("task-1", "you", "too fast").unwrap();
        next_frame(&mut peer).await;
        peer.events
            .send(ServerEvent::MessageRejected(Rejection {
                temp_id: Some(correlation),
                code: "RATE_LIMITED".into(),
                message: "rate limit exceeded".into(),
            }))
            .unwrap();

        eventually(|| client.view("task-1").first().is_some_and(Entry::is_failed)).await;
    }
}
