//! Local-first message cache.
//!
//! Two kinds of records live under a user's namespace:
//! - `threads`: the thread index, one [`Thread`] per correspondent
//! - `messages/{other}`: the ordered message list of one conversation
//!
//! Live pushes and paginated history both go through [`merge_by_id`], so a
//! message id never appears twice no matter which path delivered it first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use parley_protocol::{Correspondent, Message, Thread, UserId};

use crate::error::StoreError;
use crate::kv::{load_json, save_json, KvStore, Namespace};

/// Thread index keyed by correspondent id.
pub type ThreadIndex = BTreeMap<UserId, Thread>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Force the unread counter to zero (the thread is the active one).
    pub reset_unread: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages_per_thread: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

fn default_max_messages() -> usize {
    500
}

fn default_max_threads() -> usize {
    200
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_messages_per_thread: default_max_messages(),
            max_threads: default_max_threads(),
        }
    }
}

/// Merge two message lists keyed by id. Incoming entries replace existing
/// ones with the same id; the result is sorted by `created_at`, ties broken
/// by id.
pub fn merge_by_id(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut by_id: HashMap<&str, &Message> = HashMap::with_capacity(existing.len() + incoming.len());
    for msg in existing.iter().chain(incoming) {
        by_id.insert(msg.id.as_str(), msg);
    }
    let mut merged: Vec<Message> = by_id.into_values().cloned().collect();
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    merged
}

/// Record activity on a thread and return the updated index.
///
/// The preview and `updated_at` only move forward: an older message (for
/// example from a history page) never overwrites a newer preview.
pub fn upsert_thread(
    index: &ThreadIndex,
    other: &Correspondent,
    preview_text: &str,
    at: DateTime<Utc>,
    is_incoming: bool,
    opts: UpsertOptions,
) -> ThreadIndex {
    let mut next = index.clone();
    let thread = next.entry(other.id).or_insert_with(|| Thread {
        other_user_id: other.id,
        display_name: String::new(),
        last_preview_text: String::new(),
        updated_at: at,
        unread_count: 0,
    });

    if let Some(name) = &other.display_name {
        thread.display_name.clone_from(name);
    }
    if at >= thread.updated_at {
        thread.last_preview_text = preview_text.to_string();
        thread.updated_at = at;
    }

    if opts.reset_unread {
        thread.unread_count = 0;
    } else if is_incoming {
        thread.unread_count = thread.unread_count.saturating_add(1);
    }
    next
}

pub fn mark_thread_read(index: &ThreadIndex, other: UserId) -> ThreadIndex {
    let mut next = index.clone();
    if let Some(thread) = next.get_mut(&other) {
        thread.unread_count = 0;
    }
    next
}

/// Keep only the newest `cap` messages. Expects a sorted list.
pub fn prune_messages(mut messages: Vec<Message>, cap: usize) -> Vec<Message> {
    if messages.len() > cap {
        let excess = messages.len() - cap;
        messages.drain(..excess);
    }
    messages
}

/// Keep only the `cap` most recently updated threads. Returns the pruned
/// index and the correspondents that were dropped from it.
pub fn prune_threads(mut index: ThreadIndex, cap: usize) -> (ThreadIndex, Vec<UserId>) {
    if index.len() <= cap {
        return (index, Vec::new());
    }
    let mut by_age: Vec<(DateTime<Utc>, UserId)> =
        index.values().map(|t| (t.updated_at, t.other_user_id)).collect();
    by_age.sort();
    let excess = index.len() - cap;
    let evicted: Vec<UserId> = by_age.into_iter().take(excess).map(|(_, id)| id).collect();
    for id in &evicted {
        index.remove(id);
    }
    (index, evicted)
}

/// Persisted per-identity cache. Read-modify-write cycles are serialized by
/// an internal lock so concurrent merges never lose each other's messages.
pub struct MessageCache {
    store: Arc<dyn KvStore>,
    ns: Namespace,
    retention: RetentionConfig,
    write_lock: Mutex<()>,
}

impl MessageCache {
    pub fn new(store: Arc<dyn KvStore>, user_id: UserId, retention: RetentionConfig) -> Self {
        Self {
            store,
            ns: Namespace::for_user(user_id),
            retention,
            write_lock: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.ns.user_id()
    }

    fn threads_key(&self) -> String {
        self.ns.key("threads")
    }

    fn messages_prefix(&self) -> String {
        self.ns.key("messages")
    }

    fn messages_key(&self, other: UserId) -> String {
        format!("{}/{other}", self.messages_prefix())
    }

    /// Load the thread index. Missing or corrupt state yields an empty index.
    pub async fn load_thread_index(&self) -> ThreadIndex {
        let key = self.threads_key();
        match load_json::<ThreadIndex>(self.store.as_ref(), &key).await {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                warn!(user_id = self.ns.user_id(), "discarding thread index: {}", e);
                ThreadIndex::new()
            }
        }
    }

    pub async fn save_thread_index(&self, index: &ThreadIndex) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store_index(index.clone()).await.map(|_| ())
    }

    /// Prune, persist and drop the message records of evicted threads.
    /// Callers hold the write lock.
    async fn store_index(&self, index: ThreadIndex) -> Result<ThreadIndex, StoreError> {
        let (pruned, evicted) = prune_threads(index, self.retention.max_threads);
        save_json(self.store.as_ref(), &self.threads_key(), &pruned).await?;
        for other in evicted {
            debug!(user_id = self.ns.user_id(), other_user_id = other, "thread evicted by retention");
            self.store.delete(&self.messages_key(other)).await?;
        }
        Ok(pruned)
    }

    /// Load one conversation. Missing or corrupt state yields an empty list.
    pub async fn load_messages(&self, other: UserId) -> Vec<Message> {
        let key = self.messages_key(other);
        match load_json::<Vec<Message>>(self.store.as_ref(), &key).await {
            Ok(messages) => messages.unwrap_or_default(),
            Err(e) => {
                warn!(
                    user_id = self.ns.user_id(),
                    other_user_id = other,
                    "discarding message cache: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    pub async fn save_messages(&self, other: UserId, messages: &[Message]) -> Result<(), StoreError> {
        let mut sorted = merge_by_id(&[], messages);
        sorted = prune_messages(sorted, self.retention.max_messages_per_thread);
        save_json(self.store.as_ref(), &self.messages_key(other), &sorted).await
    }

    /// Merge `incoming` into the persisted conversation and return the
    /// resulting list.
    pub async fn merge_messages(
        &self,
        other: UserId,
        incoming: &[Message],
    ) -> Result<Vec<Message>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.load_messages(other).await;
        let merged = prune_messages(
            merge_by_id(&existing, incoming),
            self.retention.max_messages_per_thread,
        );
        save_json(self.store.as_ref(), &self.messages_key(other), &merged).await?;
        debug!(
            other_user_id = other,
            added = incoming.len(),
            total = merged.len(),
            "merged messages"
        );
        Ok(merged)
    }

    /// Drop one message by id. Returns whether it was present.
    pub async fn remove_message(&self, other: UserId, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut messages = self.load_messages(other).await;
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Ok(false);
        }
        save_json(self.store.as_ref(), &self.messages_key(other), &messages).await?;
        Ok(true)
    }

    /// Apply `f` to the persisted thread index and save the result.
    pub async fn update_thread_index<F>(&self, f: F) -> Result<ThreadIndex, StoreError>
    where
        F: FnOnce(&ThreadIndex) -> ThreadIndex + Send,
    {
        let _guard = self.write_lock.lock().await;
        let current = self.load_thread_index().await;
        self.store_index(f(&current)).await
    }

    /// Remove every cached conversation and the thread index of this
    /// identity, including conversations no longer listed in the index.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        for key in self.store.list(&self.messages_prefix()).await? {
            self.store.delete(&key).await?;
        }
        self.store.delete(&self.threads_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FileStore, MemoryStore};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64, text: &str) -> Message {
        Message {
            id: id.into(),
            text: text.into(),
            created_at: at(secs),
            author_id: 2,
            mine: false,
        }
    }

    fn ids(list: &[Message]) -> Vec<&str> {
        list.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn merge_dedupes_and_sorts() {
        let existing = vec![msg("1", 10, "a"), msg("3", 30, "c")];
        let incoming = vec![msg("2", 20, "b"), msg("3", 30, "c2")];
        let merged = merge_by_id(&existing, &incoming);
        assert_eq!(ids(&merged), vec!["1", "2", "3"]);
        // Incoming copy wins
        assert_eq!(merged[2].text, "c2");
    }

    #[test]
    fn merge_breaks_timestamp_ties_by_id() {
        let merged = merge_by_id(&[msg("b", 5, "")], &[msg("a", 5, "")]);
        assert_eq!(ids(&merged), vec!["a", "b"]);
    }

    #[test]
    fn history_then_live_push_keeps_one_copy() {
        let history = vec![msg("41", 1, "old"), msg("42", 2, "hello")];
        let live = vec![msg("42", 2, "hello")];
        let merged = merge_by_id(&merge_by_id(&[], &history), &live);
        assert_eq!(merged.iter().filter(|m| m.id == "42").count(), 1);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn upsert_creates_thread_and_counts_incoming() {
        let other = Correspondent::named(9, "Ana");
        let index = upsert_thread(&ThreadIndex::new(), &other, "hi", at(0), true, UpsertOptions::default());
        let thread = &index[&9];
        assert_eq!(thread.display_name, "Ana");
        assert_eq!(thread.last_preview_text, "hi");
        assert_eq!(thread.unread_count, 1);

        let index = upsert_thread(&index, &Correspondent::new(9), "mine", at(1), false, UpsertOptions::default());
        assert_eq!(index[&9].unread_count, 1);
        assert_eq!(index[&9].last_preview_text, "mine");
        // Anonymous update keeps the known name
        assert_eq!(index[&9].display_name, "Ana");
    }

    #[test]
    fn upsert_reset_forces_zero() {
        let other = Correspondent::new(3);
        let mut index = ThreadIndex::new();
        for i in 0..4 {
            index = upsert_thread(&index, &other, "x", at(i), true, UpsertOptions::default());
        }
        assert_eq!(index[&3].unread_count, 4);
        let index = upsert_thread(&index, &other, "y", at(5), true, UpsertOptions { reset_unread: true });
        assert_eq!(index[&3].unread_count, 0);
    }

    #[test]
    fn upsert_older_message_keeps_newer_preview() {
        let other = Correspondent::new(3);
        let index = upsert_thread(&ThreadIndex::new(), &other, "new", at(100), false, UpsertOptions::default());
        let index = upsert_thread(&index, &other, "old", at(50), true, UpsertOptions::default());
        assert_eq!(index[&3].last_preview_text, "new");
        assert_eq!(index[&3].updated_at, at(100));
        assert_eq!(index[&3].unread_count, 1);
    }

    #[test]
    fn upsert_does_not_mutate_input() {
        let index = ThreadIndex::new();
        let _ = upsert_thread(&index, &Correspondent::new(1), "x", at(0), true, UpsertOptions::default());
        assert!(index.is_empty());
    }

    #[test]
    fn mark_read_zeroes_unread() {
        let index = upsert_thread(&ThreadIndex::new(), &Correspondent::new(1), "x", at(0), true, UpsertOptions::default());
        let index = mark_thread_read(&index, 1);
        assert_eq!(index[&1].unread_count, 0);
        // Unknown thread is a no-op
        assert_eq!(mark_thread_read(&index, 77), index);
    }

    #[test]
    fn prune_messages_drops_oldest() {
        let list: Vec<Message> = (0..10).map(|i| msg(&i.to_string(), i, "")).collect();
        let pruned = prune_messages(list, 3);
        assert_eq!(ids(&pruned), vec!["7", "8", "9"]);
    }

    #[test]
    fn prune_threads_drops_least_recent() {
        let mut index = ThreadIndex::new();
        for id in 1..=5u64 {
            index = upsert_thread(&index, &Correspondent::new(id), "x", at(id as i64), false, UpsertOptions::default());
        }
        let (pruned, evicted) = prune_threads(index, 2);
        assert_eq!(pruned.keys().copied().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(evicted, vec![1, 2, 3]);
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (0u8..20, 0i64..50, "[a-z]{0,6}").prop_map(|(id, secs, text)| Message {
            id: id.to_string(),
            text,
            created_at: at(secs),
            author_id: 1,
            mine: false,
        })
    }

    fn unique_by_id(list: Vec<Message>) -> Vec<Message> {
        let mut seen = std::collections::HashSet::new();
        list.into_iter().filter(|m| seen.insert(m.id.clone())).collect()
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(a in prop::collection::vec(arb_message(), 0..30),
                               b in prop::collection::vec(arb_message(), 0..30)) {
            let once = merge_by_id(&a, &b);
            let twice = merge_by_id(&once, &b);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn merge_is_order_independent_for_distinct_copies(
            a in prop::collection::vec(arb_message(), 0..30),
            b in prop::collection::vec(arb_message(), 0..30),
        ) {
            // Same id always carries the same payload when the relay delivers it twice
            let a = unique_by_id(a);
            let b: Vec<Message> = unique_by_id(b)
                .into_iter()
                .filter(|m| !a.iter().any(|x| x.id == m.id))
                .collect();
            prop_assert_eq!(merge_by_id(&a, &b), merge_by_id(&b, &a));
        }

        #[test]
        fn merge_has_unique_sorted_ids(a in prop::collection::vec(arb_message(), 0..30),
                                       b in prop::collection::vec(arb_message(), 0..30)) {
            let merged = merge_by_id(&a, &b);
            let mut seen = std::collections::HashSet::new();
            for m in &merged {
                prop_assert!(seen.insert(m.id.clone()));
            }
            for pair in merged.windows(2) {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
            }
        }

        #[test]
        fn upsert_unread_counts_only_incoming(incoming in any::<bool>(), start in 0u32..100) {
            let mut index = ThreadIndex::new();
            index.insert(5, Thread {
                other_user_id: 5,
                display_name: String::new(),
                last_preview_text: String::new(),
                updated_at: at(0),
                unread_count: start,
            });
            let next = upsert_thread(&index, &Correspondent::new(5), "p", at(1), incoming, UpsertOptions::default());
            prop_assert_eq!(next[&5].unread_count, start + u32::from(incoming));

            let reset = upsert_thread(&index, &Correspondent::new(5), "p", at(1), incoming, UpsertOptions { reset_unread: true });
            prop_assert_eq!(reset[&5].unread_count, 0);
        }
    }

    fn memory_cache(user: UserId) -> (Arc<MemoryStore>, MessageCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = MessageCache::new(store.clone(), user, RetentionConfig::default());
        (store, cache)
    }

    #[tokio::test]
    async fn merge_messages_persists() {
        let (_, cache) = memory_cache(1);
        cache.merge_messages(2, &[msg("1", 1, "a")]).await.unwrap();
        let merged = cache.merge_messages(2, &[msg("1", 1, "a"), msg("2", 2, "b")]).await.unwrap();
        assert_eq!(ids(&merged), vec!["1", "2"]);
        assert_eq!(ids(&cache.load_messages(2).await), vec!["1", "2"]);
        assert!(cache.load_messages(3).await.is_empty());
    }

    #[tokio::test]
    async fn caches_are_partitioned_by_identity() {
        let store = Arc::new(MemoryStore::new());
        let alice = MessageCache::new(store.clone(), 1, RetentionConfig::default());
        let bob = MessageCache::new(store.clone(), 2, RetentionConfig::default());
        alice.merge_messages(9, &[msg("1", 1, "secret")]).await.unwrap();
        assert!(bob.load_messages(9).await.is_empty());
        assert_eq!(store.keys(), vec!["users/1/messages/9".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_state_is_treated_as_empty() {
        let (store, cache) = memory_cache(1);
        store.put("users/1/threads", b"garbage").await.unwrap();
        store.put("users/1/messages/2", b"[{").await.unwrap();
        assert!(cache.load_thread_index().await.is_empty());
        assert!(cache.load_messages(2).await.is_empty());

        // A merge overwrites the corrupt record
        cache.merge_messages(2, &[msg("1", 1, "a")]).await.unwrap();
        assert_eq!(cache.load_messages(2).await.len(), 1);
    }

    #[tokio::test]
    async fn retention_is_applied_on_save() {
        let store = Arc::new(MemoryStore::new());
        let cache = MessageCache::new(
            store,
            1,
            RetentionConfig {
                max_messages_per_thread: 3,
                max_threads: 2,
            },
        );
        let list: Vec<Message> = (0..5).map(|i| msg(&format!("m{i}"), i, "")).collect();
        cache.save_messages(2, &list).await.unwrap();
        assert_eq!(ids(&cache.load_messages(2).await), vec!["m2", "m3", "m4"]);

        for id in 1..=3u64 {
            cache
                .update_thread_index(|idx| {
                    upsert_thread(idx, &Correspondent::new(id), "x", at(id as i64), true, UpsertOptions::default())
                })
                .await
                .unwrap();
        }
        let index = cache.load_thread_index().await;
        assert_eq!(index.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn evicted_threads_lose_their_messages() {
        let store = Arc::new(MemoryStore::new());
        let cache = MessageCache::new(
            store.clone(),
            1,
            RetentionConfig {
                max_messages_per_thread: 10,
                max_threads: 1,
            },
        );
        for other in [2u64, 3] {
            cache.merge_messages(other, &[msg(&format!("m{other}"), other as i64, "plaintext")]).await.unwrap();
            cache
                .update_thread_index(|idx| {
                    upsert_thread(idx, &Correspondent::new(other), "plaintext", at(other as i64), true, UpsertOptions::default())
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.load_thread_index().await.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert!(cache.load_messages(2).await.is_empty());
        assert_eq!(store.keys(), vec!["users/1/messages/3".to_string(), "users/1/threads".to_string()]);
    }

    #[tokio::test]
    async fn clear_removes_conversations_missing_from_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        let cache = MessageCache::new(
            store.clone(),
            1,
            RetentionConfig {
                max_messages_per_thread: 10,
                max_threads: 1,
            },
        );
        cache.merge_messages(2, &[msg("a", 1, "first")]).await.unwrap();
        cache.merge_messages(3, &[msg("b", 2, "second")]).await.unwrap();
        cache
            .update_thread_index(|idx| {
                upsert_thread(idx, &Correspondent::new(3), "second", at(2), true, UpsertOptions::default())
            })
            .await
            .unwrap();
        // Thread 2 never made it into the index
        assert!(!cache.load_thread_index().await.contains_key(&2));

        cache.clear().await.unwrap();
        assert!(store.list("users/1/messages").await.unwrap().is_empty());
        assert!(!dir.path().join("users/1/messages/2.json").exists());
        assert!(!dir.path().join("users/1/messages/3.json").exists());
        assert!(!dir.path().join("users/1/threads.json").exists());
    }

    #[tokio::test]
    async fn remove_message_replaces_echo() {
        let (_, cache) = memory_cache(1);
        cache
            .merge_messages(2, &[msg("local-abc", 1, "hi"), msg("5", 0, "before")])
            .await
            .unwrap();
        assert!(cache.remove_message(2, "local-abc").await.unwrap());
        assert!(!cache.remove_message(2, "local-abc").await.unwrap());
        assert_eq!(ids(&cache.load_messages(2).await), vec!["5"]);
    }

    #[tokio::test]
    async fn concurrent_merges_do_not_lose_messages() {
        let (_, cache) = memory_cache(1);
        let cache = Arc::new(cache);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.merge_messages(2, &[msg(&i.to_string(), i, "")]).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(cache.load_messages(2).await.len(), 16);
    }

    #[tokio::test]
    async fn file_backed_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = MessageCache::new(Arc::new(FileStore::new(dir.path())), 1, RetentionConfig::default());
            cache.merge_messages(2, &[msg("1", 1, "persisted")]).await.unwrap();
            cache
                .update_thread_index(|idx| {
                    upsert_thread(idx, &Correspondent::named(2, "Bo"), "persisted", at(1), true, UpsertOptions::default())
                })
                .await
                .unwrap();
        }
        let cache = MessageCache::new(Arc::new(FileStore::new(dir.path())), 1, RetentionConfig::default());
        assert_eq!(cache.load_messages(2).await[0].text, "persisted");
        let index = cache.load_thread_index().await;
        assert_eq!(index[&2].unread_count, 1);
        assert_eq!(index[&2].updated_at, at(1));
        assert!(index[&2].updated_at < at(1) + Duration::seconds(1));

        cache.clear().await.unwrap();
        assert!(cache.load_messages(2).await.is_empty());
        assert!(cache.load_thread_index().await.is_empty());
    }
}
