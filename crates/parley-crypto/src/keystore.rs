//! Per-identity keypair lifecycle.
//!
//! ```text
//! NotReady -> Generating -> Persisted -> Uploaded
//!                               ^            |
//!                               +-- upload failed (retried on next ensure)
//! ```
//!
//! A `Persisted` identity can already encrypt and decrypt; it only becomes
//! reachable for new correspondents once the directory holds its public key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use parley_protocol::UserId;
use parley_store::kv::{load_json, save_json};
use parley_store::{KvStore, Namespace, StoreError};

use crate::error::{DirectoryError, KeyStoreError};
use crate::identity::{
    generate_record, parse_private_key_pem, IdentityKeys, KeyPairRecord, KeygenProgress,
    DEFAULT_KEY_BITS,
};

/// Unscoped slots written by older app versions.
pub const LEGACY_PRIVATE_KEY_SLOT: &str = "legacy/private_key";
pub const LEGACY_PUBLIC_KEY_SLOT: &str = "legacy/public_key";

const KEYPAIR_SUFFIX: &str = "keypair";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored,
    /// The directory already holds a key for this identity.
    AlreadyRegistered,
}

/// Remote public-key directory.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn upload_public_key(
        &self,
        token: &str,
        public_key_pem: &str,
    ) -> Result<UploadOutcome, DirectoryError>;

    /// `Ok(None)` when the user exists but has not published a key yet.
    async fn fetch_public_key(
        &self,
        token: &str,
        user_id: UserId,
    ) -> Result<Option<String>, DirectoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    NotReady,
    Generating,
    Persisted,
    Uploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated,
    AlreadyMigrated,
    NothingToMigrate,
}

type ProgressFn = dyn Fn(UserId, KeygenProgress) + Send + Sync;

pub struct KeyStore {
    store: Arc<dyn KvStore>,
    directory: Arc<dyn KeyDirectory>,
    key_bits: usize,
    states: Mutex<HashMap<UserId, KeyState>>,
    loaded: Mutex<HashMap<UserId, Arc<IdentityKeys>>>,
    ensure_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    progress: Option<Arc<ProgressFn>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| {
        warn!("keystore mutex poisoned, recovering");
        p.into_inner()
    })
}

impl KeyStore {
    pub fn new(store: Arc<dyn KvStore>, directory: Arc<dyn KeyDirectory>) -> Self {
        Self {
            store,
            directory,
            key_bits: DEFAULT_KEY_BITS,
            states: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
            ensure_locks: Mutex::new(HashMap::new()),
            progress: None,
        }
    }

    pub fn with_key_bits(mut self, bits: usize) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(UserId, KeygenProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn directory(&self) -> &Arc<dyn KeyDirectory> {
        &self.directory
    }

    fn record_key(user_id: UserId) -> String {
        Namespace::for_user(user_id).key(KEYPAIR_SUFFIX)
    }

    fn set_state(&self, user_id: UserId, state: KeyState) {
        lock(&self.states).insert(user_id, state);
    }

    /// Generate a fresh keypair on the blocking pool. Nothing is persisted.
    pub async fn generate_keypair(&self, user_id: UserId) -> Result<KeyPairRecord, KeyStoreError> {
        self.set_state(user_id, KeyState::Generating);
        let bits = self.key_bits;
        let progress = self.progress.clone();
        let result = tokio::task::spawn_blocking(move || {
            let report = move |p: KeygenProgress| {
                if let Some(f) = &progress {
                    f(user_id, p);
                }
            };
            generate_record(bits, &report)
        })
        .await;

        match result {
            Ok(Ok(record)) => {
                info!(user_id, bits, "generated identity keypair");
                Ok(record)
            }
            Ok(Err(e)) => {
                self.set_state(user_id, KeyState::NotReady);
                Err(e.into())
            }
            Err(join_err) => {
                self.set_state(user_id, KeyState::NotReady);
                Err(KeyStoreError::Keygen(join_err.to_string()))
            }
        }
    }

    /// Write the user's keypair record, replacing any previous one.
    pub async fn persist(&self, user_id: UserId, record: &KeyPairRecord) -> Result<(), KeyStoreError> {
        let keys = IdentityKeys::from_record(record)?;
        save_json(self.store.as_ref(), &Self::record_key(user_id), record).await?;
        lock(&self.loaded).insert(user_id, Arc::new(keys));
        let state = if record.uploaded {
            KeyState::Uploaded
        } else {
            KeyState::Persisted
        };
        self.set_state(user_id, state);
        Ok(())
    }

    pub async fn load_record(&self, user_id: UserId) -> Result<Option<KeyPairRecord>, KeyStoreError> {
        Ok(load_json(self.store.as_ref(), &Self::record_key(user_id)).await?)
    }

    /// Move pre-namespacing key material into `user_id`'s record.
    pub async fn migrate_legacy(&self, user_id: UserId) -> Result<MigrationOutcome, KeyStoreError> {
        if self.load_record(user_id).await?.is_some() {
            return Ok(MigrationOutcome::AlreadyMigrated);
        }
        let Some(private_pem) = self.store.get(LEGACY_PRIVATE_KEY_SLOT).await? else {
            return Ok(MigrationOutcome::NothingToMigrate);
        };
        let private_pem =
            Zeroizing::new(String::from_utf8(private_pem).map_err(|e| StoreError::Corrupt {
                key: LEGACY_PRIVATE_KEY_SLOT.into(),
                reason: e.to_string(),
            })?);
        let record = match self.store.get(LEGACY_PUBLIC_KEY_SLOT).await? {
            Some(public_pem) => {
                let public_pem = String::from_utf8_lossy(&public_pem).into_owned();
                KeyPairRecord::from_pems(&public_pem, &private_pem)?
            }
            None => KeyPairRecord::from_private(&parse_private_key_pem(&private_pem)?)?,
        };

        self.persist(user_id, &record).await?;
        let read_back = self.load_record(user_id).await?;
        if read_back.map(|r| r.public_key_pem) != Some(record.public_key_pem.clone()) {
            return Err(StoreError::Corrupt {
                key: Self::record_key(user_id),
                reason: "migrated record did not read back".into(),
            }
            .into());
        }
        self.store.delete(LEGACY_PRIVATE_KEY_SLOT).await?;
        self.store.delete(LEGACY_PUBLIC_KEY_SLOT).await?;
        info!(user_id, "migrated legacy key material");
        Ok(MigrationOutcome::Migrated)
    }

    /// Whether usable key material exists for `user_id`.
    pub async fn is_ready(&self, user_id: UserId) -> bool {
        self.load_keys(user_id).await.is_ok()
    }

    pub async fn key_state(&self, user_id: UserId) -> KeyState {
        let known = lock(&self.states).get(&user_id).copied();
        if let Some(state) = known {
            return state;
        }
        match self.load_record(user_id).await {
            Ok(Some(record)) if record.uploaded => KeyState::Uploaded,
            Ok(Some(_)) => KeyState::Persisted,
            _ => KeyState::NotReady,
        }
    }

    /// Parsed keys for `user_id`, cached after the first load.
    pub async fn load_keys(&self, user_id: UserId) -> Result<Arc<IdentityKeys>, KeyStoreError> {
        let cached = lock(&self.loaded).get(&user_id).cloned();
        if let Some(keys) = cached {
            return Ok(keys);
        }
        let record = match self.load_record(user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(KeyStoreError::KeyUnavailable(user_id)),
            Err(e) => {
                warn!(user_id, "unreadable keypair record: {}", e);
                return Err(KeyStoreError::KeyUnavailable(user_id));
            }
        };
        let keys = Arc::new(IdentityKeys::from_record(&record)?);
        lock(&self.loaded).insert(user_id, keys.clone());
        Ok(keys)
    }

    /// Make sure `user_id` has a persisted keypair and try to publish it.
    ///
    /// Idempotent. Upload failures leave the identity `Persisted` and are
    /// retried on the next call. Concurrent calls for one identity are
    /// serialized so exactly one keypair is generated.
    pub async fn ensure_for_user(&self, user_id: UserId, token: &str) -> Result<KeyState, KeyStoreError> {
        let user_lock = lock(&self.ensure_locks)
            .entry(user_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = user_lock.lock().await;

        if let Err(e) = self.migrate_legacy(user_id).await {
            warn!(user_id, "legacy key migration failed: {}", e);
        }

        let existing = match self.load_record(user_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(user_id, "discarding unreadable keypair record: {}", e);
                None
            }
        };
        let mut record = match existing {
            Some(record) if record.uploaded => {
                self.set_state(user_id, KeyState::Uploaded);
                return Ok(KeyState::Uploaded);
            }
            Some(record) => record,
            None => {
                let record = self.generate_keypair(user_id).await?;
                if let Err(e) = self.persist(user_id, &record).await {
                    warn!(user_id, "generated keypair could not be stored: {}", e);
                    self.set_state(user_id, KeyState::NotReady);
                    return Err(e);
                }
                record
            }
        };

        match self
            .directory
            .upload_public_key(token, &record.public_key_pem)
            .await
        {
            Ok(outcome) => {
                debug!(user_id, ?outcome, "public key published");
                record.uploaded = true;
                self.persist(user_id, &record).await?;
                Ok(KeyState::Uploaded)
            }
            Err(e) => {
                warn!(user_id, "public key upload failed, will retry: {}", e);
                self.set_state(user_id, KeyState::Persisted);
                Ok(KeyState::Persisted)
            }
        }
    }

    /// Drop all key material of `user_id` (logout or account deletion).
    pub async fn forget(&self, user_id: UserId) -> Result<(), KeyStoreError> {
        self.store.delete(&Self::record_key(user_id)).await?;
        lock(&self.loaded).remove(&user_id);
        lock(&self.states).remove(&user_id);
        info!(user_id, "forgot identity keys");
        Ok(())
    }
}
