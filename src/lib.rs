//! rowcache - cache-protocol engine backed by a transactional row store
//!
//! rowcache serves key-value cache verbs (get, set, add, replace, append,
//! prepend, cas, delete, incr/decr, flush) out of a table in a row store.
//! Each client connection gets a reusable read path and write path
//! (transaction plus cursors); commits are batched across operations.
//!
//! # Quick Start
//!
//! ```ignore
//! use rowcache::{CacheEngine, CacheItem, ConnectionId, CookieTable, MemRowStore, StoreOp};
//!
//! let engine = CacheEngine::builder(store, Arc::new(CookieTable::new())).open()?;
//! let conn = ConnectionId::new(1);
//!
//! engine.store(conn, CacheItem::new("user:123", "Alice"), StoreOp::Set)?;
//! let item = engine.get(conn, b"user:123")?;
//! engine.release_connection(conn);
//! ```
//!
//! # Architecture
//!
//! - `rowcache-core`: types, item semantics, schema mapping, collaborator traits
//! - `rowcache-storage`: in-memory row store, cache, table locker and log
//! - `rowcache-concurrency`: connection registry and lifecycle manager
//! - `rowcache-engine`: configuration, routing, verb translation

pub use rowcache_concurrency::{BatchPolicy, CookieTable, LifecycleManager, Registry};
pub use rowcache_core::*;
pub use rowcache_engine::*;
pub use rowcache_storage::{MemCache, MemDurabilityLog, MemRowStore, MemTableLocker};
