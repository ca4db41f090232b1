//! Recording implementations of the SQL-layer collaborators
//!
//! - [`MemTableLocker`]: hands out sessions and table locks and remembers
//!   which are still held, so teardown can be checked
//! - [`MemDurabilityLog`]: appends records to a vector

use parking_lot::Mutex;
use rowcache_core::{
    DurabilityLog, Error, ExternalTable, LockMode, LogRecord, Result, SessionId, TableLocker,
    TableName,
};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Default)]
struct LockerInner {
    next: u64,
    sessions: FxHashSet<SessionId>,
    locks: FxHashMap<ExternalTable, (SessionId, TableName, LockMode)>,
}

/// [`TableLocker`] that tracks open sessions and held table locks
#[derive(Debug, Default)]
pub struct MemTableLocker {
    inner: Mutex<LockerInner>,
}

impl MemTableLocker {
    /// Create a locker with nothing open
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions opened and not closed
    pub fn open_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Table locks taken and not released
    pub fn held_locks(&self) -> usize {
        self.inner.lock().locks.len()
    }
}

impl TableLocker for MemTableLocker {
    fn open_session(&self) -> Result<SessionId> {
        let mut inner = self.inner.lock();
        inner.next += 1;
        let session = SessionId(inner.next);
        inner.sessions.insert(session);
        Ok(session)
    }

    fn lock_table(
        &self,
        session: SessionId,
        table: &TableName,
        mode: LockMode,
    ) -> Result<ExternalTable> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains(&session) {
            return Err(Error::InvalidOperation(format!(
                "session {} is not open",
                session.0
            )));
        }
        inner.next += 1;
        let handle = ExternalTable(inner.next);
        inner.locks.insert(handle, (session, table.clone(), mode));
        Ok(handle)
    }

    fn unlock_table(&self, session: SessionId, table: ExternalTable) -> Result<()> {
        let mut inner = self.inner.lock();
        let owned = matches!(inner.locks.get(&table), Some((owner, _, _)) if *owner == session);
        if !owned {
            return Err(Error::InvalidOperation(format!(
                "table handle {} is not locked by session {}",
                table.0, session.0
            )));
        }
        inner.locks.remove(&table);
        Ok(())
    }

    fn close_session(&self, session: SessionId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.locks.values().any(|(owner, _, _)| *owner == session) {
            return Err(Error::InvalidOperation(format!(
                "session {} still holds table locks",
                session.0
            )));
        }
        if !inner.sessions.remove(&session) {
            return Err(Error::InvalidOperation(format!(
                "session {} is not open",
                session.0
            )));
        }
        Ok(())
    }
}

/// [`DurabilityLog`] that keeps every appended record in memory
#[derive(Debug, Default)]
pub struct MemDurabilityLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemDurabilityLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records in append order
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True if nothing was appended
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl DurabilityLog for MemDurabilityLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
