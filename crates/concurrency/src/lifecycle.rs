//! Connection lifecycle manager
//!
//! Turns a connection identity plus an access intent into a leased state
//! whose cursors are open and attached to live transactions, and decides
//! after each operation whether those transactions commit.
//!
//! ## Paths
//!
//! Each state has a read path and a write path. A path is a transaction
//! plus a cursor on the clustered index and, when the mapped index is a
//! secondary one, a cursor on that index too.
//!
//! - The read path is built first for every operation, at `IS` (or `X` for
//!   exclusive requests, which stop there). An exclusive request on a state
//!   that already reads commits its write transaction, then upgrades the
//!   read cursors in place.
//! - Mutating operations add the write path at the requested mode.
//! - After a batched commit the transaction handle is gone but the cursors
//!   remain; the next acquire begins a new transaction and reattaches them.
//!
//! Path construction goes through a [`PathBuilder`]: if any step fails, the
//! builder closes the cursors it opened and rolls its transaction back when
//! it goes out of scope, and the state keeps the handles it had before.

use crate::batch::BatchPolicy;
use crate::registry::{Registry, RegistryGuard};
use crate::state::{ConnectionLease, Handles};
use rowcache_core::{
    AccessIntent, ConnectionId, CursorHandle, Error, IndexSpec, IsolationLevel, LockMode, OpKind,
    Result, RowStore, TableName, TxnHandle,
};
use tracing::{debug, error, trace, warn};

/// Table and index the connection cursors are opened on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorTarget {
    /// Mapped table
    pub table: TableName,
    /// Index searched by key
    pub index: IndexSpec,
}

impl CursorTarget {
    /// Create a target
    pub fn new(table: TableName, index: IndexSpec) -> Self {
        Self { table, index }
    }

    /// True if a secondary-index cursor is needed besides the primary one
    pub fn uses_secondary(&self) -> bool {
        self.index.is_secondary()
    }
}

/// Which path a [`PathBuilder`] is building (for logging)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Read transaction and cursors
    Read,
    /// Write transaction and cursors
    Write,
}

impl PathKind {
    fn as_str(&self) -> &'static str {
        match self {
            PathKind::Read => "read",
            PathKind::Write => "write",
        }
    }
}

/// Scope guard for building one path
///
/// Begins a transaction, then attaches cursors to it. Unless
/// [`PathBuilder::finish`] is called, dropping the builder closes every
/// cursor it opened and rolls the transaction back. Retained cursors that
/// were only rebound are left open; they are detached again once the
/// transaction is gone.
pub struct PathBuilder<'a> {
    store: &'a dyn RowStore,
    target: &'a CursorTarget,
    kind: PathKind,
    txn: TxnHandle,
    opened: Vec<CursorHandle>,
    finished: bool,
}

impl<'a> PathBuilder<'a> {
    /// Begin the path's transaction
    pub fn begin(store: &'a dyn RowStore, target: &'a CursorTarget, kind: PathKind) -> Result<Self> {
        let txn = store.begin_transaction(IsolationLevel::ReadUncommitted)?;
        Ok(Self {
            store,
            target,
            kind,
            txn,
            opened: Vec::with_capacity(2),
            finished: false,
        })
    }

    /// Transaction being built
    pub fn txn(&self) -> TxnHandle {
        self.txn
    }

    /// Reattach `retained` (rebind + lock) or open a new cursor on `index`
    pub fn attach(
        &mut self,
        retained: Option<CursorHandle>,
        index: &IndexSpec,
        mode: LockMode,
    ) -> Result<CursorHandle> {
        match retained {
            Some(cursor) => {
                self.store.rebind_cursor(cursor, self.txn)?;
                self.store.lock(cursor, mode)?;
                Ok(cursor)
            }
            None => {
                let cursor = self
                    .store
                    .open_cursor(&self.target.table, index, self.txn, mode)?;
                self.opened.push(cursor);
                Ok(cursor)
            }
        }
    }

    /// Attach the primary cursor and, if mapped, the secondary one
    pub fn attach_all(
        &mut self,
        primary: Option<CursorHandle>,
        secondary: Option<CursorHandle>,
        mode: LockMode,
    ) -> Result<(CursorHandle, Option<CursorHandle>)> {
        let primary = self.attach(primary, &IndexSpec::Primary, mode)?;
        let target = self.target;
        let secondary = if target.uses_secondary() {
            Some(self.attach(secondary, &target.index, mode)?)
        } else {
            None
        };
        Ok((primary, secondary))
    }

    /// Keep everything built so far
    pub fn finish(mut self) -> TxnHandle {
        self.finished = true;
        self.txn
    }
}

impl Drop for PathBuilder<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for cursor in self.opened.drain(..) {
            if let Err(e) = self.store.close_cursor(cursor) {
                warn!(target: "rowcache::conn", %cursor, error = %e, "Failed to close cursor of abandoned path");
            }
        }
        if let Err(e) = self.store.rollback(self.txn) {
            warn!(target: "rowcache::conn", txn = %self.txn, error = %e, "Failed to roll back abandoned path");
        }
        debug!(target: "rowcache::conn", path = self.kind.as_str(), txn = %self.txn, "Rolled back partially built path");
    }
}

/// Hands out ready-to-use connection states and applies batched commits
#[derive(Debug)]
pub struct LifecycleManager {
    registry: Registry,
    target: CursorTarget,
    policy: BatchPolicy,
}

impl LifecycleManager {
    /// Create a manager over `registry`
    pub fn new(registry: Registry, target: CursorTarget, policy: BatchPolicy) -> Self {
        Self {
            registry,
            target,
            policy,
        }
    }

    /// The registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Table and index the cursors are opened on
    pub fn target(&self) -> &CursorTarget {
        &self.target
    }

    /// Commit policy
    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    fn store(&self) -> &dyn RowStore {
        self.registry.store()
    }

    // ========================================================================
    // Acquire
    // ========================================================================

    /// Lease the state of `identity`, ready for an operation with `intent`
    ///
    /// The registry lock is held only while the state is looked up or
    /// created. On error the state keeps its previous handles and is not
    /// in use.
    pub fn acquire(&self, identity: ConnectionId, intent: AccessIntent) -> Result<ConnectionLease> {
        let lease = self.registry.create_or_get(identity)?;
        self.prepare(&lease, intent)?;
        Ok(lease)
    }

    /// [`LifecycleManager::acquire`] for callers already holding the
    /// registry lock
    pub fn acquire_locked(
        &self,
        guard: &mut RegistryGuard<'_>,
        identity: ConnectionId,
        intent: AccessIntent,
    ) -> Result<ConnectionLease> {
        let lease = guard.create_or_get(identity)?;
        self.prepare(&lease, intent)?;
        Ok(lease)
    }

    fn prepare(&self, lease: &ConnectionLease, intent: AccessIntent) -> Result<()> {
        let mut handles = lease.state().handles();
        if handles.reclaimed {
            return Err(Error::InvalidOperation(format!(
                "{} was reclaimed",
                lease.state().id()
            )));
        }

        let exclusive = intent.lock_mode.is_exclusive();
        if !handles.has_read_path() {
            let mode = if exclusive {
                LockMode::Exclusive
            } else {
                LockMode::IntentShared
            };
            self.ensure_read_path(&mut handles, mode)?;
            if exclusive {
                return Ok(());
            }
        } else if exclusive {
            // The state's own write transaction holds IX, which X conflicts with
            if handles.has_write_path() {
                debug!(target: "rowcache::txn", state = %lease.state().id(), "Committing write path before exclusive upgrade");
                handles.commit_write(self.store())?;
            }
            // Already reading: upgrade the read path in place
            let cursors = [handles.read_cursor, handles.read_idx_cursor];
            for cursor in cursors.into_iter().flatten() {
                self.store().lock(cursor, LockMode::Exclusive)?;
            }
            return Ok(());
        }

        if intent.mutating {
            self.ensure_write_path(&mut handles, intent.lock_mode)?;
        }
        trace!(
            target: "rowcache::conn",
            identity = %lease.identity(),
            state = %lease.state().id(),
            mutating = intent.mutating,
            "Acquired connection state"
        );
        Ok(())
    }

    fn ensure_read_path(&self, handles: &mut Handles, mode: LockMode) -> Result<()> {
        let mut builder = PathBuilder::begin(self.store(), &self.target, PathKind::Read)?;
        let (primary, secondary) =
            builder.attach_all(handles.read_cursor, handles.read_idx_cursor, mode)?;
        handles.read_txn = Some(builder.finish());
        handles.read_cursor = Some(primary);
        handles.read_idx_cursor = secondary;
        Ok(())
    }

    fn ensure_write_path(&self, handles: &mut Handles, mode: LockMode) -> Result<()> {
        if handles.has_write_path() {
            return Ok(());
        }
        let mut builder = PathBuilder::begin(self.store(), &self.target, PathKind::Write)?;
        let (primary, secondary) =
            builder.attach_all(handles.write_cursor, handles.write_idx_cursor, mode)?;
        self.ensure_external_lock(handles)?;
        handles.write_txn = Some(builder.finish());
        handles.write_cursor = Some(primary);
        handles.write_idx_cursor = secondary;
        Ok(())
    }

    /// Open a SQL-layer session and lock the table, when a locker is set
    ///
    /// Whatever is obtained is recorded at once so teardown releases it
    /// even if a later step fails.
    fn ensure_external_lock(&self, handles: &mut Handles) -> Result<()> {
        let Some(locker) = self.registry.locker() else {
            return Ok(());
        };
        if handles.external_table.is_some() {
            return Ok(());
        }
        let session = match handles.session {
            Some(session) => session,
            None => {
                let session = locker.open_session()?;
                handles.session = Some(session);
                session
            }
        };
        let table = locker.lock_table(session, &self.target.table, LockMode::IntentExclusive)?;
        handles.external_table = Some(table);
        Ok(())
    }

    // ========================================================================
    // Batched commit
    // ========================================================================

    /// Account for a completed operation, commit what the policy says is
    /// due, and release the lease
    ///
    /// - `Read`: the read transaction commits every `read_batch` reads
    /// - `Write` / `Delete`: the write transaction commits every
    ///   `write_batch` mutations
    /// - `Flush`: both transactions commit and all cursors close
    ///
    /// Committed paths keep their cursors (except on `Flush`).
    pub fn reset_for(&self, lease: ConnectionLease, kind: OpKind) -> Result<()> {
        let result = {
            let mut handles = lease.state().handles();
            if handles.reclaimed {
                Ok(())
            } else {
                self.apply_reset(&mut handles, kind)
            }
        };
        drop(lease);
        result
    }

    fn apply_reset(&self, handles: &mut Handles, kind: OpKind) -> Result<()> {
        let store = self.store();
        match kind {
            OpKind::Read => {
                handles.reads += 1;
                if self.policy.should_commit(kind, handles.reads) {
                    trace!(target: "rowcache::txn", reads = handles.reads, "Committing read batch");
                    return handles.commit_read(store);
                }
            }
            OpKind::Write | OpKind::Delete => {
                handles.writes += 1;
                if self.policy.should_commit(kind, handles.writes) {
                    trace!(target: "rowcache::txn", writes = handles.writes, "Committing write batch");
                    return handles.commit_write(store);
                }
            }
            OpKind::Flush => {
                let failures = handles.release_row_store(store);
                if failures > 0 {
                    return Err(Error::storage(format!(
                        "{} handle(s) failed to release on flush reset",
                        failures
                    )));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Remove every row of the mapped table on behalf of `identity`
    ///
    /// Runs under one registry-lock hold:
    /// 1. reset the caller's own state with `Flush`
    /// 2. reclaim every state, committing their transactions
    /// 3. acquire a fresh state for the caller at `X` (read path only)
    /// 4. truncate under that transaction
    /// 5. tear the caller's state down, releasing the exclusive lock
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionBusy` if the caller's state is in use
    /// - the acquire error if the exclusive lock cannot be taken
    /// - `Error::TruncateFailed` if the truncate itself failed; the lock
    ///   has been released by then
    pub fn flush_table(&self, identity: ConnectionId) -> Result<()> {
        let mut guard = self.registry.lock();

        if let Some(own) = guard.bound_state(identity) {
            if !own.try_claim() {
                return Err(Error::ConnectionBusy(identity));
            }
            let lease = ConnectionLease::new(own);
            if let Err(e) = self.reset_for(lease, OpKind::Flush) {
                warn!(target: "rowcache::engine", %identity, error = %e, "Flush reset of own state failed");
            }
        }

        let removed = guard.clean(true);
        debug!(target: "rowcache::engine", removed, "Closed all connection states for flush");

        let lease = self.acquire_locked(&mut guard, identity, AccessIntent::exclusive())?;
        let truncated = lease
            .read_txn()
            .and_then(|txn| self.store().truncate_table(txn, &self.target.table));

        let id = lease.state().id();
        drop(lease);
        guard.reclaim(id, true);
        drop(guard);

        truncated.map_err(|e| {
            error!(target: "rowcache::engine", table = %self.target.table, error = %e, "Table flush failed");
            Error::TruncateFailed {
                table: self.target.table.to_string(),
                source: Box::new(e),
            }
        })
    }

    /// The protocol layer closed `identity`
    pub fn release_connection(&self, identity: ConnectionId) -> bool {
        self.registry.lock().release_identity(identity)
    }

    /// Tear every state down; returns how many were removed
    pub fn shutdown(&self) -> usize {
        let removed = self.registry.clean(true);
        debug!(target: "rowcache::engine", removed, "Released all connection states");
        removed
    }
}
