//! In-memory connector and recording listener for transport tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_protocol::{Heartbeat, ServerFrame};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::auth::ConnectRequest;
use super::connection::ConnectionListener;
use super::socket::{Connector, SocketCommand, SocketEvent, SocketHandle};
use crate::error::TransportError;

/// Server side of one accepted mock socket.
pub(crate) struct MockServer {
    pub request: ConnectRequest,
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<SocketCommand>,
}

impl MockServer {
    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.send(SocketEvent::Text(text.to_string()));
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code,
            reason: String::new(),
        });
    }

    /// Next text frame the client wrote; `None` once the client closed.
    pub async fn next_text(&mut self) -> Option<String> {
        match self.from_client.recv().await? {
            SocketCommand::Text(text) => Some(text),
            SocketCommand::Close => None,
        }
    }

    pub async fn wait_closed(&mut self) {
        while self.next_text().await.is_some() {}
    }

    pub fn try_next_text(&mut self) -> Option<String> {
        match self.from_client.try_recv().ok()? {
            SocketCommand::Text(text) => Some(text),
            SocketCommand::Close => None,
        }
    }
}

#[derive(Default)]
struct ConnectorState {
    script: VecDeque<TransportError>,
    requests: Vec<(Instant, ConnectRequest)>,
}

pub(crate) struct MockConnector {
    state: Mutex<ConnectorState>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: Mutex::new(ConnectorState::default()),
                servers: tx,
            }),
            rx,
        )
    }

    /// Make the next connect attempt fail. Attempts without a scripted
    /// failure succeed.
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().unwrap().script.push_back(error);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().requests.iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketHandle, TransportError> {
        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.requests.push((Instant::now(), request.clone()));
            state.script.pop_front()
        };
        if let Some(error) = scripted {
            return Err(error);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(MockServer {
            request: request.clone(),
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(SocketHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[derive(Default)]
struct Recorded {
    opens: usize,
    closes: Vec<Option<u16>>,
    errors: usize,
    messages: Vec<ServerFrame>,
    heartbeats: usize,
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    recorded: Mutex<Recorded>,
    changed: Notify,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.recorded.lock().unwrap().opens
    }

    pub fn closes(&self) -> Vec<Option<u16>> {
        self.recorded.lock().unwrap().closes.clone()
    }

    pub fn errors(&self) -> usize {
        self.recorded.lock().unwrap().errors
    }

    pub fn heartbeats(&self) -> usize {
        self.recorded.lock().unwrap().heartbeats
    }

    pub fn messages(&self) -> Vec<ServerFrame> {
        self.recorded.lock().unwrap().messages.clone()
    }

    pub async fn wait_messages(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.recorded.lock().unwrap().messages.len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, f: impl FnOnce(&mut Recorded)) {
        f(&mut self.recorded.lock().unwrap());
        self.changed.notify_waiters();
    }
}

impl ConnectionListener for RecordingListener {
    fn on_open(&self) {
        self.record(|r| r.opens += 1);
    }

    fn on_close(&self, code: Option<u16>, _reason: &str) {
        self.record(|r| r.closes.push(code));
    }

    fn on_error(&self, _error: &TransportError) {
        self.record(|r| r.errors += 1);
    }

    fn on_message(&self, frame: &ServerFrame) {
        let frame = frame.clone();
        self.record(|r| r.messages.push(frame));
    }

    fn on_heartbeat(&self, _beat: &Heartbeat) {
        self.record(|r| r.heartbeats += 1);
    }
}
