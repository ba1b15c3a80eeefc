//! Connection lifecycle on the consuming side.
//!
//! Handlers live on the session, not on the transport, so they carry over
//! every reconnect. A link that drops before [`ReconnectPolicy::min_stable`]
//! counts as a failed attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{ClientFrame, EventKind, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries are exhausted; only an explicit `connect` leaves this state.
    Abandoned,
}

/// Lifecycle notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// A handshake succeeded (first connect or any reconnect).
    Connected,
    /// The credential is stale; retrying with it is pointless.
    TokenExpired,
    Abandoned { attempts: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("token expired")]
    TokenExpired,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("connect attempt timed out")]
    Timeout,

    #[error("link dropped right after the handshake")]
    Dropped,
}

/// An established connection as two channels.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

/// The far side of an in-process [`Link`].
pub struct LinkPeer {
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub frames: mpsc::UnboundedReceiver<ClientFrame>,
}

impl Link {
    pub fn pair() -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                events: in_tx,
                frames: out_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, token: &str) -> Result<Link, ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
    /// How long a link must stay up before its drop resets the attempt count.
    pub min_stable: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            min_stable: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before retry number `attempt` (1-based): doubles from
    /// `initial_delay`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
type SignalHandler = Arc<dyn Fn(&SessionSignal) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    handlers: Mutex<HashMap<EventKind, Vec<EventHandler>>>,
    signal_handlers: Mutex<Vec<SignalHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    /// Bumped by every `connect`/`disconnect`; a loop that sees a newer
    /// generation stops without touching shared state.
    generation: AtomicU64,
    attempts: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, frame: ClientFrame) -> bool {
        if *self.state.borrow() != ConnectionState::Connected {
            return false;
        }
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn dispatch(&self, event: &ServerEvent) {
        let handlers: Vec<EventHandler> = lock(&self.handlers)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }

    fn raise(&self, signal: SessionSignal) {
        let handlers: Vec<SignalHandler> = lock(&self.signal_handlers).clone();
        for handler in handlers {
            handler(&signal);
        }
    }
}

/// Cloneable handle to one logical connection.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

/// A handle that does not keep the session alive; handlers capture this.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<Inner>,
}

impl WeakSession {
    pub fn emit(&self, frame: ClientFrame) -> bool {
        self.inner.upgrade().is_some_and(|inner| inner.emit(frame))
    }
}

impl ClientSession {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ClientSession {
            inner: Arc::new(Inner {
                connector,
                policy,
                state,
                handlers: Mutex::new(HashMap::new()),
                signal_handlers: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a handler for one event kind. Registration is accepted in
    /// any state and survives reconnects.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn on_signal<F>(&self, handler: F)
    where
        F: Fn(&SessionSignal) + Send + Sync + 'static,
    {
        lock(&self.inner.signal_handlers).push(Arc::new(handler));
    }

    /// Starts (or restarts) the connect loop with a fresh attempt budget.
    /// Must be called inside a tokio runtime.
    pub fn connect(&self, token: impl Into<String>) {
        let token = token.into();
        let mut task = lock(&self.inner.task);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.attempts.store(0, Ordering::SeqCst);
        *lock(&self.inner.outbound) = None;
        self.inner.set_state(ConnectionState::Connecting);
        *task = Some(tokio::spawn(run(self.inner.clone(), token, generation)));
    }

    /// Queues a frame. `false` means the frame was not sent, either because
    /// the session is not connected or because the transport is gone.
    pub fn emit(&self, frame: ClientFrame) -> bool {
        self.inner.emit(frame)
    }

    /// User-initiated teardown: drops the connection, forgets every handler
    /// and does not retry.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
        *lock(&self.inner.outbound) = None;
        lock(&self.inner.handlers).clear();
        lock(&self.inner.signal_handlers).clear();
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
        debug!("session disconnected by the caller");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed attempts since the last link that stayed up.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

async fn run(inner: Arc<Inner>, token: String, generation: u64) {
    let policy = inner.policy.clone();
    loop {
        if !inner.is_current(generation) {
            return;
        }
        inner.set_state(ConnectionState::Connecting);
        let result = match tokio::time::timeout(policy.connect_timeout, inner.connector.connect(&token)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        };
        if !inner.is_current(generation) {
            return;
        }

        let failure = match result {
            Ok(link) => {
                let opened = Instant::now();
                *lock(&inner.outbound) = Some(link.outbound);
                inner.set_state(ConnectionState::Connected);
                info!("chat session connected");
                inner.raise(SessionSignal::Connected);

                let mut inbound = link.inbound;
                let mut expired = false;
                while let Some(event) = inbound.recv().await {
                    if !inner.is_current(generation) {
                        return;
                    }
                    expired = event == ServerEvent::TokenExpired;
                    inner.dispatch(&event);
                    if expired {
                        break;
                    }
                }
                if !inner.is_current(generation) {
                    return;
                }
                *lock(&inner.outbound) = None;
                inner.set_state(ConnectionState::Disconnected);
                if expired {
                    warn!("server reported an expired token; not reconnecting");
                    inner.raise(SessionSignal::TokenExpired);
                    return;
                }
                if opened.elapsed() < policy.min_stable {
                    ConnectError::Dropped
                } else {
                    warn!("chat connection lost, reconnecting");
                    inner.attempts.store(0, Ordering::SeqCst);
                    tokio::time::sleep(policy.delay(1)).await;
                    continue;
                }
            }
            Err(e) => e,
        };

        if failure == ConnectError::TokenExpired {
            warn!("handshake refused: token expired");
            inner.set_state(ConnectionState::Disconnected);
            inner.raise(SessionSignal::TokenExpired);
            return;
        }

        let attempts = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("connect attempt {attempts}/{} failed: {failure}", policy.max_attempts);
        if attempts >= policy.max_attempts {
            *lock(&inner.outbound) = None;
            inner.set_state(ConnectionState::Abandoned);
            inner.raise(SessionSignal::Abandoned { attempts });
            return;
        }
        inner.set_state(ConnectionState::Disconnected);
        tokio::time::sleep(policy.delay(attempts)).await;
    }
}
