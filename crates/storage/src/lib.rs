//! Reference collaborators for rowcache
//!
//! This crate implements the in-memory backends the engine runs against:
//! - MemRowStore: transactional row store with cursors and table locks
//! - MemCache: DashMap-backed fallback cache
//! - MemTableLocker / MemDurabilityLog: recording SQL-layer lock and log
//!
//! They are deliberately small. What they do model carefully is the
//! handle discipline the lifecycle manager depends on: cursors detach when
//! their transaction finishes, double closes are reported, and exclusive
//! table locks wait for intention locks to drain.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod external;
pub mod locks;
pub mod row_store;

pub use cache::MemCache;
pub use external::{MemDurabilityLog, MemTableLocker};
pub use locks::TableLocks;
pub use row_store::{MemRowStore, StoreStats, DEFAULT_LOCK_WAIT};
