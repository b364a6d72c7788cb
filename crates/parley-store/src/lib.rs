//! Persistence for the parley client: a namespaced key/value store and the
//! local-first message cache built on top of it.

pub mod cache;
pub mod error;
pub mod kv;

pub use cache::{
    mark_thread_read, merge_by_id, upsert_thread, MessageCache, RetentionConfig, ThreadIndex,
    UpsertOptions,
};
pub use error::StoreError;
pub use kv::{FileStore, KvStore, MemoryStore, Namespace};
