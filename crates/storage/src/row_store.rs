//! In-memory transactional row store
//!
//! `MemRowStore` is the reference [`RowStore`]: enough of a transactional
//! engine to exercise the connection lifecycle end to end.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` around all tables, transactions and cursors
//! - Rows in a `BTreeMap` keyed by the primary key column; unique secondary
//!   indexes map their column to the primary key
//! - Changes are applied in place (readers see uncommitted data); each
//!   transaction keeps an undo list used by rollback
//! - Table locks use the IS/IX/S/X compatibility matrix; a blocked request
//!   waits on a `Condvar` until a commit/rollback releases locks or the
//!   configured wait expires (`Error::LockTimeout`)
//! - Cursors belong to exactly one transaction at a time. Once that
//!   transaction finishes, the cursor is detached and every use fails with
//!   `Error::CursorDetached` until it is rebound

use crate::locks::TableLocks;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rowcache_core::{
    Column, CursorHandle, Error, IndexSpec, IsolationLevel, LockMode, Result, Row, RowStore,
    TableDef, TableName, TxnHandle,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default time a lock request waits before failing
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(50);

/// Counters maintained by [`MemRowStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Cursors opened
    pub cursors_opened: u64,
    /// Cursors closed
    pub cursors_closed: u64,
    /// Transactions begun
    pub txns_begun: u64,
    /// Transactions committed
    pub txns_committed: u64,
    /// Transactions rolled back
    pub txns_rolled_back: u64,
    /// Lock requests that timed out
    pub lock_timeouts: u64,
}

impl StoreStats {
    /// Cursors currently open
    pub fn cursors_open(&self) -> u64 {
        self.cursors_opened - self.cursors_closed
    }

    /// Transactions neither committed nor rolled back
    pub fn txns_active(&self) -> u64 {
        self.txns_begun - self.txns_committed - self.txns_rolled_back
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug)]
struct SecondaryIndex {
    column: usize,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl SecondaryIndex {
    /// Indexed value of `row`; NULL is not indexed
    fn key_of(&self, row: &Row) -> Option<Vec<u8>> {
        match row.column(self.column) {
            None | Some(Column::Null) => None,
            Some(col) => Some(col.to_bytes()),
        }
    }
}

#[derive(Debug)]
struct MemTable {
    def: TableDef,
    rows: BTreeMap<Vec<u8>, Row>,
    secondary: FxHashMap<String, SecondaryIndex>,
    locks: TableLocks,
}

impl MemTable {
    fn new(def: TableDef) -> Self {
        let secondary = def
            .secondary_indexes
            .iter()
            .map(|idx| {
                (
                    idx.name.to_ascii_lowercase(),
                    SecondaryIndex {
                        column: idx.column,
                        entries: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self {
            def,
            rows: BTreeMap::new(),
            secondary,
            locks: TableLocks::new(),
        }
    }

    fn primary_key(&self, row: &Row) -> Result<Vec<u8>> {
        self.def.key_of(row, &IndexSpec::Primary)
    }

    /// Resolve a search key on `index` to the primary key of a stored row
    fn locate(&self, index: &IndexSpec, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match index {
            IndexSpec::Primary => Ok(self.rows.contains_key(key).then(|| key.to_vec())),
            IndexSpec::Secondary(name) => self
                .secondary
                .get(&name.to_ascii_lowercase())
                .map(|idx| idx.entries.get(key).cloned())
                .ok_or_else(|| {
                    Error::storage(format!("index '{}' not found on {}", name, self.def.name))
                }),
        }
    }

    /// True if `row` would collide with a stored row other than `ignore`
    fn conflicts(&self, row: &Row, ignore: Option<&[u8]>) -> Result<bool> {
        let pk = self.primary_key(row)?;
        if self.rows.contains_key(&pk) && ignore != Some(pk.as_slice()) {
            return Ok(true);
        }
        for idx in self.secondary.values() {
            let owner = idx.key_of(row).and_then(|k| idx.entries.get(&k));
            if let Some(owner) = owner {
                if ignore != Some(owner.as_slice()) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn put(&mut self, pk: Vec<u8>, row: Row) {
        for idx in self.secondary.values_mut() {
            if let Some(k) = idx.key_of(&row) {
                idx.entries.insert(k, pk.clone());
            }
        }
        self.rows.insert(pk, row);
    }

    fn take(&mut self, pk: &[u8]) -> Option<Row> {
        let row = self.rows.remove(pk)?;
        for idx in self.secondary.values_mut() {
            if let Some(k) = idx.key_of(&row) {
                idx.entries.remove(&k);
            }
        }
        Some(row)
    }

    fn clear(&mut self) {
        self.rows.clear();
        for idx in self.secondary.values_mut() {
            idx.entries.clear();
        }
    }
}

#[derive(Debug)]
struct UndoEntry {
    table: TableName,
    pk: Vec<u8>,
    previous: Option<Row>,
}

#[derive(Debug)]
struct TxnState {
    isolation: IsolationLevel,
    undo: Vec<UndoEntry>,
    locked: Vec<TableName>,
}

#[derive(Debug)]
struct CursorState {
    table: TableName,
    index: IndexSpec,
    txn: TxnHandle,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_handle: u64,
    tables: FxHashMap<TableName, MemTable>,
    txns: FxHashMap<TxnHandle, TxnState>,
    cursors: FxHashMap<CursorHandle, CursorState>,
    stats: StoreStats,
}

impl StoreInner {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn table(&self, name: &TableName) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &TableName) -> Result<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn ensure_active(&self, txn: TxnHandle) -> Result<()> {
        if self.txns.contains_key(&txn) {
            Ok(())
        } else {
            Err(Error::TransactionNotActive(txn))
        }
    }

    /// Cursor that is open and attached to an active transaction
    fn attached(&self, cursor: CursorHandle) -> Result<(TableName, IndexSpec, TxnHandle)> {
        let state = self
            .cursors
            .get(&cursor)
            .ok_or(Error::UnknownCursor(cursor))?;
        if !self.txns.contains_key(&state.txn) {
            return Err(Error::CursorDetached(cursor));
        }
        Ok((state.table.clone(), state.index.clone(), state.txn))
    }

    /// Fail unless `txn` holds a lock covering `needed` on `table`
    fn require_lock(&self, table: &TableName, txn: TxnHandle, needed: LockMode) -> Result<()> {
        let held = self.table(table)?.locks.held_by(txn);
        match held {
            Some(mode) if mode.covers(needed) => Ok(()),
            _ => Err(Error::InvalidOperation(format!(
                "{} holds no {} lock on {}",
                txn, needed, table
            ))),
        }
    }

    fn try_grant(&mut self, table: &TableName, txn: TxnHandle, requested: LockMode) -> Result<bool> {
        self.ensure_active(txn)?;
        let locks = &mut self.table_mut(table)?.locks;
        let mode = locks.target_mode(txn, requested);
        if !locks.can_grant(txn, mode) {
            return Ok(false);
        }
        locks.grant(txn, mode);
        if let Some(state) = self.txns.get_mut(&txn) {
            if !state.locked.contains(table) {
                state.locked.push(table.clone());
            }
        }
        Ok(true)
    }

    fn finish(&mut self, txn: TxnHandle, rollback: bool) -> Result<()> {
        let state = self
            .txns
            .remove(&txn)
            .ok_or(Error::TransactionNotActive(txn))?;

        if rollback {
            for entry in state.undo.into_iter().rev() {
                if let Some(table) = self.tables.get_mut(&entry.table) {
                    table.take(&entry.pk);
                    if let Some(prev) = entry.previous {
                        table.put(entry.pk, prev);
                    }
                }
            }
            self.stats.txns_rolled_back += 1;
        } else {
            self.stats.txns_committed += 1;
        }

        for name in &state.locked {
            if let Some(table) = self.tables.get_mut(name) {
                table.locks.release(txn);
            }
        }
        Ok(())
    }

    fn record_undo(&mut self, txn: TxnHandle, table: &TableName, pk: Vec<u8>, previous: Option<Row>) {
        if let Some(state) = self.txns.get_mut(&txn) {
            state.undo.push(UndoEntry {
                table: table.clone(),
                pk,
                previous,
            });
        }
    }
}

// ============================================================================
// MemRowStore
// ============================================================================

/// In-memory [`RowStore`] with transactions, cursors and table locks
#[derive(Debug)]
pub struct MemRowStore {
    inner: Mutex<StoreInner>,
    lock_released: Condvar,
    lock_wait: Duration,
}

impl Default for MemRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRowStore {
    /// Create an empty store with the default lock wait
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    /// Create an empty store whose lock requests wait at most `lock_wait`
    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            lock_released: Condvar::new(),
            lock_wait,
        }
    }

    /// Create a table
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOperation` if the table already exists.
    pub fn create_table(&self, def: TableDef) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tables.contains_key(&def.name) {
            return Err(Error::InvalidOperation(format!(
                "table {} already exists",
                def.name
            )));
        }
        debug!(target: "rowcache::store", table = %def.name, "Created table");
        inner.tables.insert(def.name.clone(), MemTable::new(def));
        Ok(())
    }

    /// Number of rows in `table` (0 for an unknown table)
    pub fn row_count(&self, table: &TableName) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Read a row by primary key outside any transaction
    pub fn peek(&self, table: &TableName, pk: &[u8]) -> Option<Row> {
        self.inner.lock().tables.get(table)?.rows.get(pk).cloned()
    }

    /// Snapshot of the store counters
    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats
    }

    /// True if `cursor` is open (attached or not)
    pub fn is_cursor_open(&self, cursor: CursorHandle) -> bool {
        self.inner.lock().cursors.contains_key(&cursor)
    }

    /// True if `txn` has begun and not finished
    pub fn is_transaction_active(&self, txn: TxnHandle) -> bool {
        self.inner.lock().txns.contains_key(&txn)
    }

    /// Isolation level of an active transaction
    pub fn isolation_of(&self, txn: TxnHandle) -> Option<IsolationLevel> {
        self.inner.lock().txns.get(&txn).map(|t| t.isolation)
    }

    /// Current lock holders on `table`
    pub fn lock_holders(&self, table: &TableName) -> Vec<(TxnHandle, LockMode)> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.locks.holders())
            .unwrap_or_default()
    }

    fn acquire_lock(
        &self,
        inner: &mut MutexGuard<'_, StoreInner>,
        table: &TableName,
        txn: TxnHandle,
        requested: LockMode,
    ) -> Result<()> {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            if inner.try_grant(table, txn, requested)? {
                trace!(target: "rowcache::store", %table, %txn, mode = %requested, "Lock granted");
                return Ok(());
            }
            if self.lock_released.wait_until(inner, deadline).timed_out() {
                if inner.try_grant(table, txn, requested)? {
                    return Ok(());
                }
                inner.stats.lock_timeouts += 1;
                debug!(target: "rowcache::store", %table, %txn, mode = %requested, "Lock wait timed out");
                return Err(Error::LockTimeout {
                    table: table.to_string(),
                });
            }
        }
    }

    fn finish(&self, txn: TxnHandle, rollback: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.finish(txn, rollback)?;
        drop(inner);
        self.lock_released.notify_all();
        Ok(())
    }
}

impl RowStore for MemRowStore {
    fn begin_transaction(&self, isolation: IsolationLevel) -> Result<TxnHandle> {
        let mut inner = self.inner.lock();
        let txn = TxnHandle::from_raw(inner.allocate_handle());
        inner.txns.insert(
            txn,
            TxnState {
                isolation,
                undo: Vec::new(),
                locked: Vec::new(),
            },
        );
        inner.stats.txns_begun += 1;
        Ok(txn)
    }

    fn commit(&self, txn: TxnHandle) -> Result<()> {
        self.finish(txn, false)
    }

    fn rollback(&self, txn: TxnHandle) -> Result<()> {
        self.finish(txn, true)
    }

    fn open_cursor(
        &self,
        table: &TableName,
        index: &IndexSpec,
        txn: TxnHandle,
        lock_mode: LockMode,
    ) -> Result<CursorHandle> {
        let mut inner = self.inner.lock();
        inner.ensure_active(txn)?;
        inner.table(table)?.def.search_column(index)?;
        self.acquire_lock(&mut inner, table, txn, lock_mode)?;

        let cursor = CursorHandle::from_raw(inner.allocate_handle());
        inner.cursors.insert(
            cursor,
            CursorState {
                table: table.clone(),
                index: index.clone(),
                txn,
            },
        );
        inner.stats.cursors_opened += 1;
        Ok(cursor)
    }

    fn close_cursor(&self, cursor: CursorHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .cursors
            .remove(&cursor)
            .ok_or(Error::UnknownCursor(cursor))?;
        inner.stats.cursors_closed += 1;
        Ok(())
    }

    fn rebind_cursor(&self, cursor: CursorHandle, txn: TxnHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_active(txn)?;
        let state = inner
            .cursors
            .get_mut(&cursor)
            .ok_or(Error::UnknownCursor(cursor))?;
        state.txn = txn;
        Ok(())
    }

    fn lock(&self, cursor: CursorHandle, mode: LockMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let (table, _, txn) = inner.attached(cursor)?;
        self.acquire_lock(&mut inner, &table, txn, mode)
    }

    fn read_row(&self, cursor: CursorHandle, key: &[u8]) -> Result<Option<Row>> {
        let inner = self.inner.lock();
        let (table, index, txn) = inner.attached(cursor)?;
        inner.require_lock(&table, txn, LockMode::IntentShared)?;
        let t = inner.table(&table)?;
        Ok(t.locate(&index, key)?.and_then(|pk| t.rows.get(&pk).cloned()))
    }

    fn insert_row(&self, cursor: CursorHandle, row: Row) -> Result<()> {
        let mut inner = self.inner.lock();
        let (table, _, txn) = inner.attached(cursor)?;
        inner.require_lock(&table, txn, LockMode::IntentExclusive)?;

        let t = inner.table_mut(&table)?;
        if t.conflicts(&row, None)? {
            return Err(Error::DuplicateKey);
        }
        let pk = t.primary_key(&row)?;
        t.put(pk.clone(), row);
        inner.record_undo(txn, &table, pk, None);
        Ok(())
    }

    fn update_row(&self, cursor: CursorHandle, key: &[u8], row: Row) -> Result<()> {
        let mut inner = self.inner.lock();
        let (table, index, txn) = inner.attached(cursor)?;
        inner.require_lock(&table, txn, LockMode::IntentExclusive)?;

        let t = inner.table_mut(&table)?;
        let old_pk = t.locate(&index, key)?.ok_or(Error::NotFound)?;
        if t.conflicts(&row, Some(&old_pk))? {
            return Err(Error::DuplicateKey);
        }
        let new_pk = t.primary_key(&row)?;
        let previous = t.take(&old_pk);
        t.put(new_pk.clone(), row);

        let moved = new_pk != old_pk;
        inner.record_undo(txn, &table, old_pk, previous);
        if moved {
            inner.record_undo(txn, &table, new_pk, None);
        }
        Ok(())
    }

    fn delete_row(&self, cursor: CursorHandle, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        let (table, index, txn) = inner.attached(cursor)?;
        inner.require_lock(&table, txn, LockMode::IntentExclusive)?;

        let t = inner.table_mut(&table)?;
        let Some(pk) = t.locate(&index, key)? else {
            return Ok(false);
        };
        let previous = t.take(&pk);
        inner.record_undo(txn, &table, pk, previous);
        Ok(true)
    }

    fn truncate_table(&self, txn: TxnHandle, table: &TableName) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_active(txn)?;
        inner.require_lock(table, txn, LockMode::Exclusive)?;

        let t = inner.table_mut(table)?;
        let removed = t.rows.len();
        t.clear();
        // Truncate is not undone by rollback; drop undo that would resurrect rows
        if let Some(state) = inner.txns.get_mut(&txn) {
            state.undo.retain(|entry| &entry.table != table);
        }
        debug!(target: "rowcache::store", %table, %txn, removed, "Truncated table");
        Ok(())
    }

    fn describe_table(&self, table: &TableName) -> Result<TableDef> {
        Ok(self.inner.lock().table(table)?.def.clone())
    }
}
