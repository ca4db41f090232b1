//! Per-connection state
//!
//! A [`ConnectionState`] carries the reusable row-store handles of one
//! connection: a read transaction with its cursors, a write transaction
//! with its cursors, the per-path operation counters, and optionally a
//! SQL-layer session with a table lock.
//!
//! ## Ownership
//!
//! States are owned by the registry (`Arc`) and lent to one operation at a
//! time through a [`ConnectionLease`]. The in-use flag is the exclusive
//! claim; the handle set sits behind its own mutex so the registry can
//! still tear a state down during a forced cleanup.
//!
//! Every handle lives in an `Option` and is `take()`n before it is closed
//! or committed, so no handle is ever released twice.

use parking_lot::{Mutex, MutexGuard};
use rowcache_core::{
    ConnectionId, CursorHandle, Error, ExternalTable, Result, RowStore, SessionId, StateId,
    TableLocker, TxnHandle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Row-store and SQL-layer handles of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handles {
    /// Read transaction (read-uncommitted)
    pub read_txn: Option<TxnHandle>,
    /// Read cursor on the clustered index
    pub read_cursor: Option<CursorHandle>,
    /// Read cursor on the mapped secondary index
    pub read_idx_cursor: Option<CursorHandle>,
    /// Write transaction
    pub write_txn: Option<TxnHandle>,
    /// Write cursor on the clustered index
    pub write_cursor: Option<CursorHandle>,
    /// Write cursor on the mapped secondary index
    pub write_idx_cursor: Option<CursorHandle>,
    /// Reads since the read transaction last committed
    pub reads: u64,
    /// Writes and deletes since the write transaction last committed
    pub writes: u64,
    /// SQL-layer session
    pub session: Option<SessionId>,
    /// SQL-layer table lock held within `session`
    pub external_table: Option<ExternalTable>,
    /// Set once the state was torn down by the registry
    pub reclaimed: bool,
}

impl Handles {
    /// Commit the read transaction, keeping its cursors for reattachment
    pub fn commit_read(&mut self, store: &dyn RowStore) -> Result<()> {
        self.reads = 0;
        match self.read_txn.take() {
            Some(txn) => store.commit(txn),
            None => Ok(()),
        }
    }

    /// Commit the write transaction, keeping its cursors for reattachment
    pub fn commit_write(&mut self, store: &dyn RowStore) -> Result<()> {
        self.writes = 0;
        match self.write_txn.take() {
            Some(txn) => store.commit(txn),
            None => Ok(()),
        }
    }

    /// Close every cursor then commit both transactions
    ///
    /// Order: write secondary, read secondary, write primary, read primary
    /// cursors; then the read and write transactions. Each failure is
    /// logged and counted; the remaining handles are still released.
    pub fn release_row_store(&mut self, store: &dyn RowStore) -> usize {
        let mut failures = 0;
        let cursors = [
            self.write_idx_cursor.take(),
            self.read_idx_cursor.take(),
            self.write_cursor.take(),
            self.read_cursor.take(),
        ];
        for cursor in cursors.into_iter().flatten() {
            if let Err(e) = store.close_cursor(cursor) {
                warn!(target: "rowcache::conn", %cursor, error = %e, "Failed to close cursor");
                failures += 1;
            }
        }
        for txn in [self.read_txn.take(), self.write_txn.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = store.commit(txn) {
                warn!(target: "rowcache::conn", %txn, error = %e, "Failed to commit transaction");
                failures += 1;
            }
        }
        self.reads = 0;
        self.writes = 0;
        failures
    }

    /// Release the SQL-layer table lock, then close the session
    pub fn release_external(&mut self, locker: Option<&dyn TableLocker>) -> usize {
        let (session, table) = (self.session.take(), self.external_table.take());
        let Some(locker) = locker else {
            return 0;
        };
        let mut failures = 0;
        if let (Some(session), Some(table)) = (session, table) {
            if let Err(e) = locker.unlock_table(session, table) {
                warn!(target: "rowcache::conn", error = %e, "Failed to unlock external table");
                failures += 1;
            }
        }
        if let Some(session) = session {
            if let Err(e) = locker.close_session(session) {
                warn!(target: "rowcache::conn", error = %e, "Failed to close external session");
                failures += 1;
            }
        }
        failures
    }

    /// True if the read path has a live transaction
    pub fn has_read_path(&self) -> bool {
        self.read_txn.is_some()
    }

    /// True if the write path has a live transaction
    pub fn has_write_path(&self) -> bool {
        self.write_txn.is_some()
    }
}

/// State record for one connection
#[derive(Debug)]
pub struct ConnectionState {
    id: StateId,
    identity: ConnectionId,
    in_use: AtomicBool,
    handles: Mutex<Handles>,
}

impl ConnectionState {
    /// Create an idle state with no handles
    pub fn new(identity: ConnectionId) -> Self {
        Self {
            id: StateId::next(),
            identity,
            in_use: AtomicBool::new(false),
            handles: Mutex::new(Handles::default()),
        }
    }

    /// Process-unique id of this state
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Connection the state was created for
    pub fn identity(&self) -> ConnectionId {
        self.identity
    }

    /// True while an operation holds the state
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Claim the state; false if another operation holds it
    pub fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_claim(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Lock the handle set
    pub fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock()
    }

    /// Copy of the handle set
    pub fn snapshot(&self) -> Handles {
        *self.handles.lock()
    }

    /// Release every handle and mark the state reclaimed
    ///
    /// Returns the number of teardown failures, all of which were logged.
    pub fn teardown(&self, store: &dyn RowStore, locker: Option<&dyn TableLocker>) -> usize {
        let mut handles = self.handles.lock();
        let failures = handles.release_row_store(store) + handles.release_external(locker);
        handles.reclaimed = true;
        failures
    }
}

/// Cursors of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSet {
    /// Cursor on the clustered index (used for inserts)
    pub primary: CursorHandle,
    /// Cursor on the mapped secondary index, if any
    pub index: Option<CursorHandle>,
}

impl CursorSet {
    /// Cursor to search by the mapped key
    pub fn search(&self) -> CursorHandle {
        self.index.unwrap_or(self.primary)
    }
}

/// Exclusive claim on a connection state for one operation
///
/// Dropping the lease clears the in-use flag.
#[derive(Debug)]
pub struct ConnectionLease {
    state: Arc<ConnectionState>,
}

impl ConnectionLease {
    /// Wrap a state already claimed with [`ConnectionState::try_claim`]
    pub(crate) fn new(state: Arc<ConnectionState>) -> Self {
        debug_assert!(state.is_in_use());
        Self { state }
    }

    /// The leased state
    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    /// Connection identity
    pub fn identity(&self) -> ConnectionId {
        self.state.identity()
    }

    /// Read transaction
    pub fn read_txn(&self) -> Result<TxnHandle> {
        self.state
            .snapshot()
            .read_txn
            .ok_or_else(|| self.missing("read transaction"))
    }

    /// Write transaction
    pub fn write_txn(&self) -> Result<TxnHandle> {
        self.state
            .snapshot()
            .write_txn
            .ok_or_else(|| self.missing("write transaction"))
    }

    /// Cursors of the read path
    pub fn read_cursors(&self) -> Result<CursorSet> {
        let handles = self.state.snapshot();
        handles
            .read_cursor
            .map(|primary| CursorSet {
                primary,
                index: handles.read_idx_cursor,
            })
            .ok_or_else(|| self.missing("read cursor"))
    }

    /// Cursors of the write path
    pub fn write_cursors(&self) -> Result<CursorSet> {
        let handles = self.state.snapshot();
        handles
            .write_cursor
            .map(|primary| CursorSet {
                primary,
                index: handles.write_idx_cursor,
            })
            .ok_or_else(|| self.missing("write cursor"))
    }

    fn missing(&self, what: &str) -> Error {
        Error::InvalidOperation(format!(
            "{} of {} has no {}",
            self.state.id(),
            self.state.identity(),
            what
        ))
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.state.release_claim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcache_core::{
        ColumnDef, IndexSpec, IsolationLevel, LockMode, TableDef, TableName,
    };
    use rowcache_storage::{MemRowStore, MemTableLocker};

    fn store() -> MemRowStore {
        let store = MemRowStore::new();
        store
            .create_table(TableDef::new(
                TableName::new("test", "demo"),
                vec![ColumnDef::bytes("k"), ColumnDef::bytes("v")],
                0,
            ))
            .unwrap();
        store
    }

    fn open(store: &MemRowStore, mode: LockMode) -> (TxnHandle, CursorHandle) {
        let txn = store
            .begin_transaction(IsolationLevel::ReadUncommitted)
            .unwrap();
        let cur = store
            .open_cursor(&TableName::new("test", "demo"), &IndexSpec::Primary, txn, mode)
            .unwrap();
        (txn, cur)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let state = ConnectionState::new(ConnectionId::new(1));
        assert!(state.try_claim());
        assert!(!state.try_claim());
        state.release_claim();
        assert!(state.try_claim());
    }

    #[test]
    fn test_lease_drop_releases_claim() {
        let state = Arc::new(ConnectionState::new(ConnectionId::new(1)));
        assert!(state.try_claim());
        let lease = ConnectionLease::new(Arc::clone(&state));
        assert!(state.is_in_use());
        drop(lease);
        assert!(!state.is_in_use());
    }

    #[test]
    fn test_commit_keeps_cursors() {
        let store = store();
        let (txn, cur) = open(&store, LockMode::IntentShared);
        let mut handles = Handles {
            read_txn: Some(txn),
            read_cursor: Some(cur),
            reads: 7,
            ..Handles::default()
        };
        handles.commit_read(&store).unwrap();
        assert_eq!(handles.read_txn, None);
        assert_eq!(handles.read_cursor, Some(cur));
        assert_eq!(handles.reads, 0);
        assert!(store.is_cursor_open(cur));
        assert!(!store.is_transaction_active(txn));
    }

    #[test]
    fn test_teardown_releases_everything_once() {
        let store = store();
        let locker = MemTableLocker::new();
        let (rtxn, rcur) = open(&store, LockMode::IntentShared);
        let (wtxn, wcur) = open(&store, LockMode::IntentExclusive);
        let session = locker.open_session().unwrap();
        let table = locker
            .lock_table(
                session,
                &TableName::new("test", "demo"),
                LockMode::IntentExclusive,
            )
            .unwrap();

        let state = ConnectionState::new(ConnectionId::new(1));
        *state.handles() = Handles {
            read_txn: Some(rtxn),
            read_cursor: Some(rcur),
            write_txn: Some(wtxn),
            write_cursor: Some(wcur),
            session: Some(session),
            external_table: Some(table),
            ..Handles::default()
        };

        assert_eq!(state.teardown(&store, Some(&locker)), 0);
        let after = state.snapshot();
        assert!(after.reclaimed);
        assert_eq!(after.read_cursor, None);
        assert_eq!(after.session, None);
        assert_eq!(store.stats().cursors_open(), 0);
        assert_eq!(store.stats().txns_active(), 0);
        assert_eq!(locker.open_sessions(), 0);

        // Nothing left to release
        assert_eq!(state.teardown(&store, Some(&locker)), 0);
        assert_eq!(store.stats().cursors_closed, 2);
    }

    #[test]
    fn test_teardown_continues_past_failures() {
        let store = store();
        let (txn, cur) = open(&store, LockMode::IntentShared);
        store.close_cursor(cur).unwrap();

        let state = ConnectionState::new(ConnectionId::new(1));
        *state.handles() = Handles {
            read_txn: Some(txn),
            read_cursor: Some(cur),
            ..Handles::default()
        };
        assert_eq!(state.teardown(&store, None), 1);
        assert!(!store.is_transaction_active(txn));
    }

    #[test]
    fn test_lease_accessors() {
        let store = store();
        let (txn, cur) = open(&store, LockMode::IntentShared);
        let state = Arc::new(ConnectionState::new(ConnectionId::new(4)));
        assert!(state.try_claim());
        state.handles().read_txn = Some(txn);
        state.handles().read_cursor = Some(cur);

        let lease = ConnectionLease::new(Arc::clone(&state));
        assert_eq!(lease.read_txn().unwrap(), txn);
        assert_eq!(lease.read_cursors().unwrap().search(), cur);
        assert!(matches!(
            lease.write_cursors(),
            Err(Error::InvalidOperation(_))
        ));
        assert!(lease.write_txn().is_err());
        assert_eq!(lease.identity(), ConnectionId::new(4));
    }
}
