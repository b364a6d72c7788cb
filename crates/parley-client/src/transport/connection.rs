//! One logical relay connection, driven by a single actor task.
//!
//! The actor owns the socket, the outbound queue and the reconnect state
//! machine:
//!
//! ```text
//! Connecting --open--> Open --abnormal close--> Reconnecting --delay--> Connecting
//!     |                  |--auth close (armed)--> AuthRetrying --------> Connecting
//!     |                  +--1000 / caller close--> Closed
//!     +--connect error--> Reconnecting | AuthRetrying
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use parley_protocol::{decode_server_frame, encode_heartbeat, Heartbeat, ServerFrame, UserId};

use super::auth::{build_request, is_auth_close, AuthMode, TokenProvider};
use super::backoff::Backoff;
use super::socket::{Connector, SocketCommand, SocketEvent, SocketHandle, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::config::TransportConfig;
use crate::error::TransportError;

/// Callbacks for one attached consumer. All methods default to no-ops.
///
/// Callbacks run on the connection's actor task and must not block.
pub trait ConnectionListener: Send + Sync {
    fn on_open(&self) {}
    fn on_close(&self, _code: Option<u16>, _reason: &str) {}
    fn on_error(&self, _error: &TransportError) {}
    fn on_message(&self, _frame: &ServerFrame) {}
    fn on_heartbeat(&self, _beat: &Heartbeat) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    AuthRetrying,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    pub next_retry: Option<Instant>,
    pub auth_mode: AuthMode,
}

/// Registry key: one socket per relay endpoint, path and identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub endpoint: String,
    pub path: String,
    pub user_id: UserId,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| {
        warn!("listener mutex poisoned, recovering");
        p.into_inner()
    })
}

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<dyn ConnectionListener>)>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn ConnectionListener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Listeners are invoked on a snapshot so callbacks may attach or detach.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        lock(&self.entries).iter().map(|(_, l)| l.clone()).collect()
    }
}

enum Command {
    Send(String),
    Close,
}

/// Handle to a shared connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    key: ConnectionKey,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    listeners: Arc<ListenerSet>,
}

impl Connection {
    /// Start the actor for `key`. It connects immediately.
    pub(crate) fn spawn(
        key: ConnectionKey,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        config: &TransportConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Connecting,
            attempt: 0,
            next_retry: None,
            auth_mode: AuthMode::Query,
        });
        let listeners = Arc::new(ListenerSet::default());

        let actor = Actor {
            key: key.clone(),
            connector,
            tokens,
            backoff: Backoff::from_config(config),
            heartbeat: config.heartbeat_interval(),
            commands: cmd_rx,
            status: status_tx,
            listeners: listeners.clone(),
            queue: VecDeque::new(),
            mode: AuthMode::Query,
            fallback_armed: true,
            attempt: 0,
        };
        tokio::spawn(actor.run());

        Self {
            shared: Arc::new(Shared {
                key,
                commands: cmd_tx,
                status: status_rx,
                listeners,
            }),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.shared.key
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status().state == ConnectionState::Closed
    }

    /// Queue a text frame. Frames sent while not open are buffered and
    /// flushed in order on the next open. Fails once the connection is
    /// closed for good.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.shared
            .commands
            .send(Command::Send(text.into()))
            .map_err(|_| {
                warn!(user_id = self.shared.key.user_id, "send on closed connection refused");
                TransportError::Closed
            })
    }

    /// Resolve on the current or next open. Fails once the connection is
    /// closed for good.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut rx = self.shared.status.clone();
        loop {
            let state = rx.borrow_and_update().state;
            match state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed => return Err(TransportError::Closed),
                _ => {}
            }
            rx.changed().await.map_err(|_| TransportError::Closed)?;
        }
    }

    /// Close without reconnecting.
    pub fn close(&self) {
        let _ = self.shared.commands.send(Command::Close);
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn listeners(&self) -> &Arc<ListenerSet> {
        &self.shared.listeners
    }
}

enum Next {
    Reconnect,
    RetryAuth,
    Stop,
}

struct Actor {
    key: ConnectionKey,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    backoff: Backoff,
    heartbeat: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    listeners: Arc<ListenerSet>,
    queue: VecDeque<String>,
    mode: AuthMode,
    fallback_armed: bool,
    attempt: u32,
}

impl Actor {
    async fn run(mut self) {
        let mut state = ConnectionState::Connecting;
        loop {
            self.publish(state, None);
            let next = match self.connect().await {
                Ok(Some(socket)) => self.drive(socket).await,
                Ok(None) => Next::Stop,
                Err(e) => {
                    warn!(
                        user_id = self.key.user_id,
                        mode = ?self.mode,
                        "relay connect failed: {}",
                        e
                    );
                    self.emit_error(&e);
                    match e {
                        TransportError::AuthRejected(_) => self.auth_failure(),
                        TransportError::InvalidUrl(_) => Next::Stop,
                        _ => Next::Reconnect,
                    }
                }
            };

            state = match next {
                Next::Stop => break,
                Next::RetryAuth => ConnectionState::AuthRetrying,
                Next::Reconnect => {
                    if !self.wait_backoff().await {
                        break;
                    }
                    ConnectionState::Connecting
                }
            };
        }

        // Refuse further sends before announcing Closed
        self.commands.close();
        let mut dropped = self.queue.len();
        while let Ok(cmd) = self.commands.try_recv() {
            if matches!(cmd, Command::Send(_)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(user_id = self.key.user_id, dropped, "connection closed with unsent frames");
        }
        self.publish(ConnectionState::Closed, None);
        debug!(user_id = self.key.user_id, "connection actor stopped");
    }

    fn publish(&self, state: ConnectionState, next_retry: Option<Instant>) {
        self.status.send_replace(ConnectionStatus {
            state,
            attempt: self.attempt,
            next_retry,
            auth_mode: self.mode,
        });
    }

    fn emit_error(&self, error: &TransportError) {
        for listener in self.listeners.snapshot() {
            listener.on_error(error);
        }
    }

    fn emit_close(&self, code: Option<u16>, reason: &str) {
        for listener in self.listeners.snapshot() {
            listener.on_close(code, reason);
        }
    }

    /// Handle a caller command while no socket is open. Returns false on close.
    fn buffer_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Send(text)) => {
                self.queue.push_back(text);
                true
            }
            Some(Command::Close) | None => false,
        }
    }

    /// One connect attempt. `Ok(None)` means the caller closed meanwhile.
    async fn connect(&mut self) -> Result<Option<SocketHandle>, TransportError> {
        let token = self.tokens.access_token().await?;
        let request = build_request(&self.key.endpoint, &self.key.path, self.mode, &token)?;
        let connector = self.connector.clone();
        let connect = connector.connect(&request);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => return result.map(Some),
                cmd = self.commands.recv() => {
                    if !self.buffer_command(cmd) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn auth_failure(&mut self) -> Next {
        if self.fallback_armed {
            self.fallback_armed = false;
            self.mode = self.mode.other();
            info!(user_id = self.key.user_id, mode = ?self.mode, "auth rejected, switching auth mode");
            Next::RetryAuth
        } else {
            Next::Reconnect
        }
    }

    fn after_close(&mut self, code: Option<u16>) -> Next {
        if code == Some(CLOSE_NORMAL) {
            Next::Stop
        } else if is_auth_close(code) {
            self.auth_failure()
        } else {
            Next::Reconnect
        }
    }

    async fn drive(&mut self, mut socket: SocketHandle) -> Next {
        self.attempt = 0;
        self.fallback_armed = true;
        self.publish(ConnectionState::Open, None);
        info!(user_id = self.key.user_id, mode = ?self.mode, "relay connection open");
        for listener in self.listeners.snapshot() {
            listener.on_open();
        }

        while let Some(text) = self.queue.pop_front() {
            if let Err(mpsc::error::SendError(SocketCommand::Text(text))) =
                socket.outbound.send(SocketCommand::Text(text))
            {
                self.queue.push_front(text);
                break;
            }
        }

        let mut heartbeat = self
            .heartbeat
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                event = socket.inbound.recv() => match event {
                    Some(SocketEvent::Text(text)) => self.dispatch(&text),
                    Some(SocketEvent::Error(e)) => {
                        self.emit_error(&TransportError::Unreachable(e));
                    }
                    Some(SocketEvent::Closed { code, reason }) => {
                        info!(user_id = self.key.user_id, ?code, "relay connection closed: {}", reason);
                        self.emit_close(code, &reason);
                        return self.after_close(code);
                    }
                    None => {
                        self.emit_close(Some(CLOSE_ABNORMAL), "socket dropped");
                        return Next::Reconnect;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        if let Err(mpsc::error::SendError(SocketCommand::Text(text))) =
                            socket.outbound.send(SocketCommand::Text(text))
                        {
                            self.queue.push_back(text);
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = socket.outbound.send(SocketCommand::Close);
                        self.emit_close(Some(CLOSE_NORMAL), "closed by client");
                        return Next::Stop;
                    }
                },
                _ = next_tick(&mut heartbeat) => {
                    match encode_heartbeat(&Heartbeat::now()) {
                        Ok(frame) => {
                            let _ = socket.outbound.send(SocketCommand::Text(frame));
                        }
                        Err(e) => warn!("failed to encode heartbeat: {}", e),
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match decode_server_frame(text) {
            Ok(ServerFrame::Heartbeat(beat)) => {
                for listener in self.listeners.snapshot() {
                    listener.on_heartbeat(&beat);
                }
            }
            Ok(frame) => {
                for listener in self.listeners.snapshot() {
                    listener.on_message(&frame);
                }
            }
            Err(e) => warn!(user_id = self.key.user_id, "dropping undecodable frame: {}", e),
        }
    }

    /// Sleep out the backoff delay, buffering sends. Returns false if the
    /// caller closed meanwhile.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let deadline = Instant::now() + delay;
        self.publish(ConnectionState::Reconnecting, Some(deadline));
        debug!(user_id = self.key.user_id, attempt = self.attempt, ?delay, "reconnect scheduled");

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if !self.buffer_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
