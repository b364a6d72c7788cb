//! Conversation controller: turns relay frames into decrypted, cached
//! messages and user sends into encrypted envelopes.
//!
//! One controller serves one identity. Inbound frames are forwarded from the
//! connection's listener callback to a single pump task, so they are applied
//! to the cache in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rsa::RsaPublicKey;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_crypto::{
    decrypt_symmetric, encrypt_symmetric, parse_public_key_pem, unwrap_key, wrap_key,
    DecryptOutcome, IdentityKeys, KeyStore, SealedMessage,
};
use parley_protocol::types::LOCAL_ID_PREFIX;
use parley_protocol::{
    encode_envelope, Correspondent, InboundEnvelope, Message, OutboundEnvelope, RelayError,
    ServerFrame, UserId,
};
use parley_store::{
    mark_thread_read, upsert_thread, KvStore, MessageCache, RetentionConfig, ThreadIndex,
    UpsertOptions,
};

use crate::api::HistoryApi;
use crate::error::ControllerError;
use crate::transport::{
    Connection, ConnectionListener, ConnectionManager, ConnectionState, ConnectionTarget,
    Subscription,
};

const EVENT_CAPACITY: usize = 256;

/// Notifications for the UI layer.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// A message was decrypted and recorded, live or as the relay's copy of
    /// one of our own sends.
    MessageReceived { other: UserId, message: Message },
    ThreadsChanged(ThreadIndex),
    /// Cached messages of a thread that was just opened.
    ThreadOpened { other: UserId, messages: Vec<Message> },
    /// A history page was merged; `messages` is the whole cached thread.
    HistoryLoaded {
        other: UserId,
        messages: Vec<Message>,
        next_page: Option<u32>,
    },
    /// The relay stored a submitted message under `message_id`.
    Accepted { message_id: Option<String> },
    SendFailed { code: String, message: String },
    /// The correspondent has not published a public key yet.
    EncryptionPending { other: UserId },
    Connection(ConnectionState),
}

/// Collaborators a controller needs besides its connection.
pub struct ControllerDeps {
    pub keys: Arc<KeyStore>,
    pub store: Arc<dyn KvStore>,
    pub history: Arc<dyn HistoryApi>,
    pub retention: RetentionConfig,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
struct ActiveThread {
    other: UserId,
    display_name: Option<String>,
}

/// The controller's current attachment to the shared connection.
struct Link {
    connection: Connection,
    subscription: Option<Subscription>,
}

struct Inner {
    me: UserId,
    target: ConnectionTarget,
    manager: ConnectionManager,
    forwarder: Arc<FrameForwarder>,
    link: Mutex<Link>,
    /// Signalled whenever `link` is replaced.
    relinked: Notify,
    keys: Arc<KeyStore>,
    cache: MessageCache,
    history: Arc<dyn HistoryApi>,
    page_size: u32,
    events: broadcast::Sender<ConversationEvent>,
    active: Mutex<Option<ActiveThread>>,
    /// In-flight history fetches and the thread each one is for.
    history_tasks: Mutex<Vec<(UserId, JoinHandle<()>)>>,
    recipient_keys: Mutex<HashMap<UserId, Arc<RsaPublicKey>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| {
        warn!("controller mutex poisoned, recovering");
        p.into_inner()
    })
}

/// Forwards frames from the connection actor to the pump task.
struct FrameForwarder {
    frames: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnectionListener for FrameForwarder {
    fn on_message(&self, frame: &ServerFrame) {
        let _ = self.frames.send(frame.clone());
    }
}

pub struct ConversationController {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
    status_watch: JoinHandle<()>,
}

impl ConversationController {
    /// Attach to the identity's shared connection and start processing
    /// frames. Must be called inside a tokio runtime.
    pub fn start(manager: &ConnectionManager, target: ConnectionTarget, deps: ControllerDeps) -> Self {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let forwarder = Arc::new(FrameForwarder { frames: frame_tx });
        let (connection, subscription) = manager.attach(&target, forwarder.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            me: target.user_id,
            cache: MessageCache::new(deps.store, target.user_id, deps.retention),
            target,
            manager: manager.clone(),
            forwarder,
            link: Mutex::new(Link {
                connection,
                subscription: Some(subscription),
            }),
            relinked: Notify::new(),
            keys: deps.keys,
            history: deps.history,
            page_size: deps.page_size,
            events,
            active: Mutex::new(None),
            history_tasks: Mutex::new(Vec::new()),
            recipient_keys: Mutex::new(HashMap::new()),
        });

        let pump = {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    inner.handle_frame(frame).await;
                }
            })
        };

        let status_watch = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut last = None;
                loop {
                    let mut status = inner.connection().watch_status();
                    loop {
                        let state = status.borrow_and_update().state;
                        if last != Some(state) {
                            last = Some(state);
                            inner.emit(ConversationEvent::Connection(state));
                        }
                        if state == ConnectionState::Closed || status.changed().await.is_err() {
                            break;
                        }
                    }
                    // Closed for good until the next send re-attaches
                    inner.relinked.notified().await;
                }
            })
        };

        info!(user_id = inner.me, "conversation controller started");
        Self {
            inner,
            pump,
            status_watch,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.me
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    /// The connection currently in use. After the relay closes it, the
    /// next send attaches a fresh one.
    pub fn connection(&self) -> Connection {
        self.inner.connection()
    }

    pub async fn threads(&self) -> ThreadIndex {
        self.inner.cache.load_thread_index().await
    }

    pub async fn messages(&self, other: UserId) -> Vec<Message> {
        self.inner.cache.load_messages(other).await
    }

    pub fn active_thread(&self) -> Option<UserId> {
        self.inner.active_other()
    }

    /// Encrypt `text` for `other` and submit it. Returns the local echo that
    /// was appended to the thread. Nothing is cached if the frame could not
    /// be handed to the connection.
    pub async fn send_text(&self, other: UserId, text: &str) -> Result<Message, ControllerError> {
        self.inner.send_text(other, text).await
    }

    /// Make `other` the active thread: reset its unread count, tell the
    /// history service, emit the cached messages and fetch page 1.
    pub async fn open_thread(
        &self,
        other: UserId,
        display_name: Option<String>,
    ) -> Result<(), ControllerError> {
        let inner = &self.inner;
        *lock(&inner.active) = Some(ActiveThread {
            other,
            display_name: display_name.clone(),
        });
        inner.abort_history();

        let index = inner
            .cache
            .update_thread_index(move |index| {
                let mut next = mark_thread_read(index, other);
                if let (Some(thread), Some(name)) = (next.get_mut(&other), display_name) {
                    thread.display_name = name;
                }
                next
            })
            .await?;
        inner.emit(ConversationEvent::ThreadsChanged(index));

        match inner.target.tokens.access_token().await {
            Ok(token) => {
                if let Err(e) = inner.history.mark_read(&token, other).await {
                    warn!(user_id = inner.me, other, "mark_read failed: {}", e);
                }
            }
            Err(e) => warn!(user_id = inner.me, "no token for mark_read: {}", e),
        }

        let messages = inner.cache.load_messages(other).await;
        inner.emit(ConversationEvent::ThreadOpened { other, messages });
        inner.spawn_history(other, 1);
        Ok(())
    }

    /// Fetch an older history page of the active thread.
    pub fn load_older(&self, page: u32) -> Result<(), ControllerError> {
        let other = self
            .inner
            .active_other()
            .ok_or(ControllerError::NoActiveThread)?;
        self.inner.spawn_history(other, page);
        Ok(())
    }

    pub fn close_thread(&self) {
        *lock(&self.inner.active) = None;
        self.inner.abort_history();
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.pump.abort();
        self.status_watch.abort();
        self.inner.abort_history();
        let subscription = lock(&self.inner.link).subscription.take();
        drop(subscription);
    }
}

impl Inner {
    fn emit(&self, event: ConversationEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn active_other(&self) -> Option<UserId> {
        lock(&self.active).as_ref().map(|a| a.other)
    }

    /// The correspondent record for `other`, named if it is the open thread.
    fn correspondent(&self, other: UserId) -> Correspondent {
        match lock(&self.active).as_ref() {
            Some(ActiveThread {
                other: active,
                display_name: Some(name),
            }) if *active == other => Correspondent::named(other, name.clone()),
            _ => Correspondent::new(other),
        }
    }

    fn connection(&self) -> Connection {
        lock(&self.link).connection.clone()
    }

    /// The current connection, re-attaching through the manager if the
    /// relay closed the previous one.
    fn live_connection(&self) -> Connection {
        let (connection, stale) = {
            let mut link = lock(&self.link);
            if !link.connection.is_closed() {
                return link.connection.clone();
            }
            info!(user_id = self.me, "relay connection closed, re-attaching");
            let (connection, subscription) = self.manager.attach(&self.target, self.forwarder.clone());
            let stale = std::mem::replace(
                &mut *link,
                Link {
                    connection: connection.clone(),
                    subscription: Some(subscription),
                },
            );
            (connection, stale)
        };
        drop(stale);
        self.relinked.notify_one();
        connection
    }

    fn abort_history(&self) {
        for (_, task) in lock(&self.history_tasks).drain(..) {
            task.abort();
        }
    }

    /// Fetch `page` of `other`'s history. Fetches for another thread are
    /// cancelled; earlier pages of the same thread keep running.
    fn spawn_history(self: &Arc<Self>, other: UserId, page: u32) {
        let inner = self.clone();
        let task = tokio::spawn(async move { inner.load_history(other, page).await });
        let mut tasks = lock(&self.history_tasks);
        tasks.retain(|(thread, task)| {
            if *thread != other {
                task.abort();
                return false;
            }
            !task.is_finished()
        });
        tasks.push((other, task));
    }

    async fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Envelope(envelope) => self.on_envelope(&envelope).await,
            ServerFrame::Ack(ack) if ack.ok => {
                debug!(user_id = self.me, message_id = ?ack.message_id, "relay accepted message");
                self.emit(ConversationEvent::Accepted {
                    message_id: ack.message_id,
                });
            }
            ServerFrame::Ack(ack) => {
                warn!(user_id = self.me, message_id = ?ack.message_id, "relay refused message");
                self.emit(ConversationEvent::SendFailed {
                    code: "rejected".into(),
                    message: "message was not accepted".into(),
                });
            }
            ServerFrame::Error(RelayError { code, message }) => {
                warn!(user_id = self.me, code = %code, "relay error: {}", message);
                self.emit(ConversationEvent::SendFailed { code, message });
            }
            ServerFrame::Heartbeat(_) => {}
            ServerFrame::Unknown(value) => {
                debug!(user_id = self.me, "ignoring unknown frame: {}", value);
            }
        }
    }

    /// Decrypt one envelope addressed to or sent by this identity. Frames
    /// that fail any step are logged and dropped.
    fn open_envelope(&self, keys: &IdentityKeys, envelope: &InboundEnvelope) -> Option<(UserId, Message)> {
        let Some(other) = envelope.correspondent_of(self.me) else {
            warn!(user_id = self.me, message_id = %envelope.id, "envelope not addressed to this identity");
            return None;
        };
        let Some(wrapped) = envelope.wrap_for(self.me) else {
            warn!(user_id = self.me, message_id = %envelope.id, "envelope carries no key for this identity");
            return None;
        };
        let key = match unwrap_key(wrapped, &keys.private) {
            Ok(key) => key,
            Err(e) => {
                warn!(user_id = self.me, message_id = %envelope.id, "key unwrap failed: {}", e);
                return None;
            }
        };
        let sealed = SealedMessage {
            ciphertext: envelope.encrypted_message.clone(),
            iv: envelope.iv.clone(),
            mac: envelope.mac.clone(),
            key,
        };
        let text = match decrypt_symmetric(&sealed) {
            DecryptOutcome::Plaintext(text) => text,
            DecryptOutcome::AuthFailure => {
                warn!(user_id = self.me, message_id = %envelope.id, "dropping message with bad MAC");
                return None;
            }
            DecryptOutcome::DecodeFailure => {
                warn!(user_id = self.me, message_id = %envelope.id, "dropping undecodable message");
                return None;
            }
        };
        Some((
            other,
            Message {
                id: envelope.id.clone(),
                text,
                created_at: envelope.timestamp.unwrap_or_else(Utc::now),
                author_id: envelope.sender_id,
                mine: envelope.sender_id == self.me,
            },
        ))
    }

    async fn own_keys(&self) -> Option<Arc<IdentityKeys>> {
        match self.keys.load_keys(self.me).await {
            Ok(keys) => Some(keys),
            Err(e) => {
                warn!(user_id = self.me, "cannot decrypt without identity keys: {}", e);
                None
            }
        }
    }

    async fn on_envelope(&self, envelope: &InboundEnvelope) {
        let Some(keys) = self.own_keys().await else {
            return;
        };
        let Some((other, message)) = self.open_envelope(&keys, envelope) else {
            return;
        };

        let active = self.active_other() == Some(other);
        let replaced_echo = message.mine && self.replace_echo(other, &message.text).await;
        if active || replaced_echo {
            if let Err(e) = self.cache.merge_messages(other, std::slice::from_ref(&message)).await {
                warn!(user_id = self.me, other, "failed to cache message: {}", e);
            }
        }

        let correspondent = self.correspondent(other);
        let (preview, at, incoming) = (message.text.clone(), message.created_at, !message.mine);
        match self
            .cache
            .update_thread_index(move |index| {
                upsert_thread(
                    index,
                    &correspondent,
                    &preview,
                    at,
                    incoming,
                    UpsertOptions {
                        reset_unread: active,
                    },
                )
            })
            .await
        {
            Ok(index) => {
                self.emit(ConversationEvent::MessageReceived { other, message });
                self.emit(ConversationEvent::ThreadsChanged(index));
            }
            Err(e) => {
                warn!(user_id = self.me, other, "failed to update thread index: {}", e);
                self.emit(ConversationEvent::MessageReceived { other, message });
            }
        }
    }

    /// Drop the oldest pending echo in `other`'s thread whose text matches.
    async fn replace_echo(&self, other: UserId, text: &str) -> bool {
        let cached = self.cache.load_messages(other).await;
        let Some(echo) = cached
            .iter()
            .find(|m| m.mine && m.is_local_echo() && m.text == text)
        else {
            return false;
        };
        match self.cache.remove_message(other, &echo.id).await {
            Ok(removed) => {
                debug!(user_id = self.me, other, echo_id = %echo.id, "replaced local echo");
                removed
            }
            Err(e) => {
                warn!(user_id = self.me, other, "failed to drop local echo: {}", e);
                false
            }
        }
    }

    /// Public key of `other`, from memory or the directory.
    async fn recipient_key(&self, other: UserId) -> Result<Option<Arc<RsaPublicKey>>, ControllerError> {
        let cached = lock(&self.recipient_keys).get(&other).cloned();
        if let Some(key) = cached {
            return Ok(Some(key));
        }
        let token = self.target.tokens.access_token().await?;
        let Some(pem) = self.keys.directory().fetch_public_key(&token, other).await? else {
            return Ok(None);
        };
        let key = Arc::new(parse_public_key_pem(&pem)?);
        lock(&self.recipient_keys).insert(other, key.clone());
        Ok(Some(key))
    }

    async fn send_text(&self, other: UserId, text: &str) -> Result<Message, ControllerError> {
        if text.trim().is_empty() {
            return Err(ControllerError::EmptyMessage);
        }
        let Some(recipient) = self.recipient_key(other).await? else {
            info!(user_id = self.me, other, "recipient has no public key yet");
            self.emit(ConversationEvent::EncryptionPending { other });
            return Err(ControllerError::RecipientKeyUnavailable(other));
        };
        let own = self.keys.load_keys(self.me).await?;

        let sealed = encrypt_symmetric(text)?;
        let envelope = OutboundEnvelope {
            receiver_id: other,
            encrypted_key_for_receiver: wrap_key(&sealed.key, &recipient)?,
            encrypted_key_for_sender: wrap_key(&sealed.key, &own.public)?,
            encrypted_message: sealed.ciphertext,
            iv: sealed.iv,
            mac: sealed.mac,
        };
        self.live_connection().send(encode_envelope(&envelope)?)?;

        // The relay never echoes our plaintext, so record it now
        let echo = Message {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()),
            text: text.to_string(),
            created_at: Utc::now(),
            author_id: self.me,
            mine: true,
        };
        self.cache.merge_messages(other, std::slice::from_ref(&echo)).await?;
        let correspondent = self.correspondent(other);
        let (preview, at) = (echo.text.clone(), echo.created_at);
        let index = self
            .cache
            .update_thread_index(move |index| {
                upsert_thread(index, &correspondent, &preview, at, false, UpsertOptions::default())
            })
            .await?;
        self.emit(ConversationEvent::ThreadsChanged(index));
        debug!(user_id = self.me, other, "message submitted");
        Ok(echo)
    }

    async fn load_history(&self, other: UserId, page: u32) {
        let token = match self.target.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(user_id = self.me, other, "no token for history fetch: {}", e);
                return;
            }
        };
        let fetched = match self.history.fetch_page(&token, other, page, self.page_size).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(user_id = self.me, other, page, "history fetch failed: {}", e);
                return;
            }
        };
        let Some(keys) = self.own_keys().await else {
            return;
        };
        let decrypted: Vec<Message> = fetched
            .results
            .iter()
            .filter_map(|envelope| self.open_envelope(&keys, envelope))
            .filter(|(thread, _)| *thread == other)
            .map(|(_, message)| message)
            .collect();

        if self.active_other() != Some(other) {
            debug!(user_id = self.me, other, "discarding history for inactive thread");
            return;
        }

        let messages = match self.cache.merge_messages(other, &decrypted).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(user_id = self.me, other, "failed to cache history: {}", e);
                return;
            }
        };

        if let Some(newest) = decrypted.iter().max_by_key(|m| m.created_at) {
            let correspondent = self.correspondent(other);
            let (preview, at) = (newest.text.clone(), newest.created_at);
            match self
                .cache
                .update_thread_index(move |index| {
                    upsert_thread(
                        index,
                        &correspondent,
                        &preview,
                        at,
                        false,
                        UpsertOptions { reset_unread: true },
                    )
                })
                .await
            {
                Ok(index) => self.emit(ConversationEvent::ThreadsChanged(index)),
                Err(e) => warn!(user_id = self.me, other, "failed to update thread index: {}", e),
            }
        }

        debug!(user_id = self.me, other, page, count = decrypted.len(), "history page merged");
        self.emit(ConversationEvent::HistoryLoaded {
            other,
            messages,
            next_page: fetched.next_page,
        });
    }
}
