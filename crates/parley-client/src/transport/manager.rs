//! Registry of shared relay connections.
//!
//! Consumers attach a listener and get back the shared [`Connection`] plus a
//! [`Subscription`] guard. When the last guard is dropped the socket stays up
//! for a short grace window, so a consumer that detaches and re-attaches
//! right away (a screen being rebuilt, for instance) keeps the same socket.

use std::collections::{hash_map, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use parley_protocol::UserId;

use super::auth::TokenProvider;
use super::connection::{Connection, ConnectionKey, ConnectionListener, ConnectionState};
use super::socket::Connector;
use crate::config::TransportConfig;

/// Where to connect and as whom.
#[derive(Clone)]
pub struct ConnectionTarget {
    pub endpoint: String,
    pub path: String,
    pub user_id: UserId,
    pub tokens: Arc<dyn TokenProvider>,
}

impl ConnectionTarget {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            endpoint: self.endpoint.clone(),
            path: self.path.clone(),
            user_id: self.user_id,
        }
    }
}

struct Entry {
    connection: Connection,
    /// Unique per spawned connection; subscriptions taken on a replaced
    /// connection carry an old epoch and detach as no-ops.
    epoch: u64,
    subscribers: usize,
    /// Bumped on every attach and on the last detach; a pending eviction
    /// only proceeds if the generation it captured is still current.
    generation: u64,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    registry: Mutex<HashMap<ConnectionKey, Entry>>,
    next_epoch: AtomicU64,
}

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Entry>> {
        self.registry.lock().unwrap_or_else(|p| {
            warn!("connection registry mutex poisoned, recovering");
            p.into_inner()
        })
    }

    fn detach(self: &Arc<Self>, key: &ConnectionKey, epoch: u64, listener_id: u64) {
        let generation = {
            let mut registry = self.registry();
            let Some(entry) = registry.get_mut(key).filter(|e| e.epoch == epoch) else {
                debug!(user_id = key.user_id, epoch, "stale subscription released");
                return;
            };
            entry.connection.listeners().remove(listener_id);
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers > 0 {
                return;
            }
            entry.generation += 1;
            entry.generation
        };

        let grace = self.config.grace_window();
        debug!(user_id = key.user_id, ?grace, "last listener detached");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(self);
                let key = key.clone();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.evict_if_idle(&key, generation);
                    }
                });
            }
            Err(_) => self.evict_if_idle(key, generation),
        }
    }

    fn evict_if_idle(&self, key: &ConnectionKey, generation: u64) {
        let evicted = {
            let mut registry = self.registry();
            match registry.get(key) {
                Some(entry) if entry.subscribers == 0 && entry.generation == generation => {
                    registry.remove(key)
                }
                _ => None,
            }
        };
        if let Some(entry) = evicted {
            debug!(user_id = key.user_id, "evicting idle connection");
            entry.connection.close();
        }
    }
}

/// Owns every relay connection of the process. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                config,
                registry: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Attach `listener` to the connection for `target`, opening it if needed.
    pub fn attach(
        &self,
        target: &ConnectionTarget,
        listener: Arc<dyn ConnectionListener>,
    ) -> (Connection, Subscription) {
        let key = target.key();
        let (connection, epoch, listener_id) = {
            let spawn_entry = || {
                debug!(user_id = key.user_id, endpoint = %key.endpoint, "opening relay connection");
                Entry {
                    connection: Connection::spawn(
                        key.clone(),
                        self.inner.connector.clone(),
                        target.tokens.clone(),
                        &self.inner.config,
                    ),
                    epoch: self.inner.next_epoch.fetch_add(1, Ordering::Relaxed),
                    subscribers: 0,
                    generation: 0,
                }
            };
            let mut registry = self.inner.registry();
            let entry = match registry.entry(key.clone()) {
                hash_map::Entry::Occupied(mut slot) => {
                    if slot.get().connection.is_closed() {
                        slot.insert(spawn_entry());
                    }
                    slot.into_mut()
                }
                hash_map::Entry::Vacant(slot) => slot.insert(spawn_entry()),
            };
            entry.subscribers += 1;
            entry.generation += 1;
            let listener_id = entry.connection.listeners().add(listener.clone());
            (entry.connection.clone(), entry.epoch, listener_id)
        };

        // Late joiners learn the connection is already up
        if connection.status().state == ConnectionState::Open {
            listener.on_open();
        }

        let subscription = Subscription {
            manager: Arc::downgrade(&self.inner),
            key,
            epoch,
            listener_id,
            detached: false,
        };
        (connection, subscription)
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<Connection> {
        self.inner.registry().get(key).map(|e| e.connection.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// Close and evict one connection immediately, ignoring subscribers.
    pub fn destroy(&self, key: &ConnectionKey) {
        let entry = self.inner.registry().remove(key);
        if let Some(entry) = entry {
            entry.connection.close();
        }
    }

    /// Close everything, e.g. on logout.
    pub fn shutdown(&self) {
        let entries: Vec<Entry> = self.inner.registry().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.connection.close();
        }
    }
}

/// Keeps a listener attached. Dropping it detaches.
pub struct Subscription {
    manager: Weak<ManagerInner>,
    key: ConnectionKey,
    epoch: u64,
    listener_id: u64,
    detached: bool,
}

impl Subscription {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(inner) = self.manager.upgrade() {
            inner.detach(&self.key, self.epoch, self.listener_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
