//! Core traits for the collaborators around the lifecycle manager
//!
//! The engine talks to everything outside its own bookkeeping through the
//! traits in this module, so the row store, the fallback cache and the
//! protocol layer's connection slots can be swapped without touching the
//! upper layers:
//!
//! - [`RowStore`]: transactional row store (cursors, transactions, locks)
//! - [`CacheStore`]: in-memory fallback cache
//! - [`ConnectionBindings`]: per-connection engine-specific slot
//! - [`TableLocker`]: SQL-layer table locks held on behalf of a connection
//! - [`DurabilityLog`]: external change log (binlog)
//! - [`Clock`]: wall-clock source for expiration

use crate::error::Result;
use crate::item::{ArithmeticOutcome, ArithmeticRequest, CacheItem, StoreOp};
use crate::row::{IndexSpec, Row, TableDef, TableName};
use crate::types::{ConnectionId, CursorHandle, IsolationLevel, LockMode, StateId, TxnHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Transactional row-store capability surface
///
/// Cursors are opened against a table index inside a transaction. Once that
/// transaction commits or rolls back, the cursor stays open but detached;
/// it must be reattached with [`RowStore::rebind_cursor`] (and re-locked
/// with [`RowStore::lock`]) before it can be used again.
///
/// Thread safety: All methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync).
pub trait RowStore: Send + Sync {
    /// Begin a transaction
    fn begin_transaction(&self, isolation: IsolationLevel) -> Result<TxnHandle>;

    /// Commit a transaction, releasing its locks
    fn commit(&self, txn: TxnHandle) -> Result<()>;

    /// Roll back a transaction, undoing its row changes and releasing locks
    fn rollback(&self, txn: TxnHandle) -> Result<()>;

    /// Open a cursor on `index` of `table` inside `txn`, taking a table lock
    /// in `lock_mode`
    ///
    /// # Errors
    ///
    /// Returns `Error::LockTimeout` if the table lock cannot be granted.
    fn open_cursor(
        &self,
        table: &TableName,
        index: &IndexSpec,
        txn: TxnHandle,
        lock_mode: LockMode,
    ) -> Result<CursorHandle>;

    /// Close a cursor
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownCursor` for a cursor that is not open, so a
    /// double close is always reported.
    fn close_cursor(&self, cursor: CursorHandle) -> Result<()>;

    /// Attach an existing cursor to a new transaction
    fn rebind_cursor(&self, cursor: CursorHandle, txn: TxnHandle) -> Result<()>;

    /// Take the table lock in `mode` for the cursor's current transaction
    fn lock(&self, cursor: CursorHandle, mode: LockMode) -> Result<()>;

    /// Read the row whose search key (per the cursor's index) is `key`
    fn read_row(&self, cursor: CursorHandle, key: &[u8]) -> Result<Option<Row>>;

    /// Insert a new row
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateKey` if a row with the same key exists.
    fn insert_row(&self, cursor: CursorHandle, row: Row) -> Result<()>;

    /// Replace the row whose search key is `key`
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such row exists.
    fn update_row(&self, cursor: CursorHandle, key: &[u8], row: Row) -> Result<()>;

    /// Delete the row whose search key is `key`; returns whether it existed
    fn delete_row(&self, cursor: CursorHandle, key: &[u8]) -> Result<bool>;

    /// Remove every row of `table`; `txn` must hold an exclusive table lock
    fn truncate_table(&self, txn: TxnHandle, table: &TableName) -> Result<()>;

    /// Table definition (columns and indexes)
    fn describe_table(&self, table: &TableName) -> Result<TableDef>;
}

/// In-memory fallback cache consulted according to the routing mode
pub trait CacheStore: Send + Sync {
    /// Look up a live item
    fn get(&self, key: &[u8]) -> Option<CacheItem>;

    /// Apply a store verb; returns the CAS token of the stored item
    fn store(&self, item: CacheItem, op: StoreOp) -> Result<u64>;

    /// Delete an item, honoring a non-zero CAS token
    fn delete(&self, key: &[u8], cas: u64) -> Result<()>;

    /// Drop an item without any protocol checks
    fn evict(&self, key: &[u8]) -> Option<CacheItem>;

    /// Increment or decrement a counter item
    fn arithmetic(&self, key: &[u8], req: &ArithmeticRequest) -> Result<ArithmeticOutcome>;

    /// Remove every item
    fn flush(&self);
}

/// Per-connection engine-specific slot owned by the protocol layer
///
/// The engine stores the id of the connection's state here. The protocol
/// layer clears the slot when a connection closes; a reopened connection
/// may later be bound to a different state under the same identity.
pub trait ConnectionBindings: Send + Sync {
    /// Current binding of `conn`
    fn binding(&self, conn: ConnectionId) -> Option<StateId>;

    /// Bind `conn` to `state`, or clear it with `None`
    fn bind(&self, conn: ConnectionId, state: Option<StateId>);
}

/// Session handle in the SQL layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// SQL-visible table handle locked on behalf of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalTable(pub u64);

/// SQL-layer table locking, used when changes must stay visible to SQL
/// (for example when a durability log is written through that layer)
pub trait TableLocker: Send + Sync {
    /// Open a session to lock tables under
    fn open_session(&self) -> Result<SessionId>;

    /// Lock `table` within `session`
    fn lock_table(&self, session: SessionId, table: &TableName, mode: LockMode)
        -> Result<ExternalTable>;

    /// Release a table lock taken with [`TableLocker::lock_table`]
    fn unlock_table(&self, session: SessionId, table: ExternalTable) -> Result<()>;

    /// Close a session
    fn close_session(&self, session: SessionId) -> Result<()>;
}

/// Kind of change recorded in the durability log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    /// Row inserted or replaced
    Put {
        /// Item key
        key: Vec<u8>,
        /// Item value
        value: Vec<u8>,
    },
    /// Row deleted
    Delete {
        /// Item key
        key: Vec<u8>,
    },
    /// Table truncated
    Truncate,
}

/// One durability log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Table the change applies to
    pub table: TableName,
    /// The change
    pub op: LogOp,
}

/// External change log; when enabled every mutation commits on its own
pub trait DurabilityLog: Send + Sync {
    /// Append a record after the change committed
    fn append(&self, record: LogRecord) -> Result<()>;
}

/// Wall-clock source in unix seconds
pub trait Clock: Send + Sync {
    /// Current unix time in seconds
    fn now(&self) -> u64;
}

/// [`Clock`] backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe_and_send_sync() {
        fn accepts_row_store(_: &dyn RowStore) {}
        fn accepts_cache(_: &dyn CacheStore) {}
        fn accepts_bindings(_: &dyn ConnectionBindings) {}
        fn accepts_locker(_: &dyn TableLocker) {}
        fn accepts_log(_: &dyn DurabilityLog) {}
        fn accepts_clock(_: &dyn Clock) {}
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}

        assert_send_sync::<dyn RowStore>();
        assert_send_sync::<dyn CacheStore>();
        assert_send_sync::<dyn ConnectionBindings>();
        let _ = accepts_row_store;
        let _ = accepts_cache;
        let _ = accepts_bindings;
        let _ = accepts_locker;
        let _ = accepts_log;
        accepts_clock(&SystemClock);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
