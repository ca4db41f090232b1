//! Cache verbs as row-store operations
//!
//! Each verb acquires the connection's state from the lifecycle manager,
//! runs against the state's cursors, and hands the lease back through
//! `reset_for` so the batching policy decides whether to commit.
//!
//! - Lookups, updates and deletes go through the search cursor (the
//!   secondary-index cursor when one is mapped); inserts go through the
//!   clustered-index cursor.
//! - A stored row whose expiration has passed is treated as absent, but is
//!   overwritten in place rather than inserted next to.
//! - CAS tokens found in stored rows are fed back to the allocator so new
//!   tokens always exceed them.

use rowcache_concurrency::{ConnectionLease, CursorSet, LifecycleManager};
use rowcache_core::{
    apply_arithmetic, apply_store, check_delete, live, AccessIntent, ArithmeticOutcome,
    ArithmeticRequest, CacheItem, CasAllocator, Clock, ConnectionId, CursorHandle,
    DurabilityLog, Error, LogOp, LogRecord, OpKind, ResolvedMapping, Result, RowStore, StoreOp,
};
use std::sync::Arc;
use tracing::{trace, warn};

/// Stored item for a key, before and after the expiration filter
struct Lookup {
    present: bool,
    item: Option<CacheItem>,
}

/// Translates cache verbs into row-store calls for one mapped table
pub struct Translator {
    lifecycle: LifecycleManager,
    mapping: ResolvedMapping,
    cas: Arc<CasAllocator>,
    clock: Arc<dyn Clock>,
    log: Option<Arc<dyn DurabilityLog>>,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("table", self.mapping.table())
            .field("index", self.mapping.index())
            .field("durability_log", &self.log.is_some())
            .finish()
    }
}

impl Translator {
    /// Create a translator
    pub fn new(
        lifecycle: LifecycleManager,
        mapping: ResolvedMapping,
        cas: Arc<CasAllocator>,
        clock: Arc<dyn Clock>,
        log: Option<Arc<dyn DurabilityLog>>,
    ) -> Self {
        Self {
            lifecycle,
            mapping,
            cas,
            clock,
            log,
        }
    }

    /// Lifecycle manager the translator acquires states from
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Resolved table mapping
    pub fn mapping(&self) -> &ResolvedMapping {
        &self.mapping
    }

    fn store_ref(&self) -> &dyn RowStore {
        self.lifecycle.registry().store()
    }

    // ========================================================================
    // Verbs
    // ========================================================================

    /// Read the live item stored under `key`
    pub fn get(&self, identity: ConnectionId, key: &[u8]) -> Result<CacheItem> {
        self.run(identity, AccessIntent::read(), OpKind::Read, |lease| {
            let cursors = lease.read_cursors()?;
            let found = self.lookup(cursors.search(), key)?;
            let item = found.item.ok_or(Error::NotFound)?;
            Ok((item, None))
        })
    }

    /// Apply a store verb; `item.expiration` must already be absolute
    ///
    /// Returns the CAS token of the written item, 0 when the mapping has
    /// no CAS column.
    pub fn store(&self, identity: ConnectionId, item: CacheItem, op: StoreOp) -> Result<u64> {
        self.run(identity, AccessIntent::write(), OpKind::Write, |lease| {
            let cursors = lease.write_cursors()?;
            let key = item.key.clone();
            let found = self.lookup(cursors.search(), &key)?;
            let mut written = apply_store(found.item.as_ref(), item, op, self.cas.next())?;
            if !self.mapping.stores_cas() {
                written.cas = 0;
            }
            self.write_back(&cursors, &key, found.present, &written)?;
            trace!(target: "rowcache::engine", op = op.as_str(), cas = written.cas, "Stored item");
            let change = LogOp::Put {
                key,
                value: written.value,
            };
            Ok((written.cas, Some(change)))
        })
    }

    /// Delete `key`; a non-zero `cas` must match the stored token
    pub fn delete(&self, identity: ConnectionId, key: &[u8], cas: u64) -> Result<()> {
        self.run(identity, AccessIntent::write(), OpKind::Delete, |lease| {
            let cursors = lease.write_cursors()?;
            let found = self.lookup(cursors.search(), key)?;
            check_delete(found.item.as_ref(), cas)?;
            if !self.store_ref().delete_row(cursors.search(), key)? {
                return Err(Error::NotFound);
            }
            Ok(((), Some(LogOp::Delete { key: key.to_vec() })))
        })
    }

    /// Increment or decrement the counter stored under `key`
    pub fn arithmetic(
        &self,
        identity: ConnectionId,
        key: &[u8],
        req: &ArithmeticRequest,
    ) -> Result<ArithmeticOutcome> {
        self.run(identity, AccessIntent::write(), OpKind::Write, |lease| {
            let cursors = lease.write_cursors()?;
            let found = self.lookup(cursors.search(), key)?;
            let now = self.clock.now();
            let mut outcome = apply_arithmetic(key, found.item.as_ref(), req, now, self.cas.next())?;
            if !self.mapping.stores_cas() {
                outcome.item.cas = 0;
            }
            self.write_back(&cursors, key, found.present, &outcome.item)?;
            let change = LogOp::Put {
                key: key.to_vec(),
                value: outcome.item.value.clone(),
            };
            Ok((outcome, Some(change)))
        })
    }

    /// Truncate the mapped table on behalf of `identity`
    pub fn flush(&self, identity: ConnectionId) -> Result<()> {
        self.lifecycle.flush_table(identity)?;
        self.append(LogOp::Truncate)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Acquire, run `op`, reset; then log the change once it committed
    ///
    /// The lease is always handed back through `reset_for`, also when `op`
    /// failed. The operation's own error takes precedence over a reset
    /// error.
    fn run<T>(
        &self,
        identity: ConnectionId,
        intent: AccessIntent,
        kind: OpKind,
        op: impl FnOnce(&ConnectionLease) -> Result<(T, Option<LogOp>)>,
    ) -> Result<T> {
        let lease = self.lifecycle.acquire(identity, intent)?;
        let result = op(&lease);
        let reset = self.lifecycle.reset_for(lease, kind);

        let (value, change) = result?;
        reset?;
        if let Some(change) = change {
            self.append(change)?;
        }
        Ok(value)
    }

    fn lookup(&self, cursor: CursorHandle, key: &[u8]) -> Result<Lookup> {
        let row = self.store_ref().read_row(cursor, key)?;
        let stored = row.map(|row| self.mapping.row_to_item(&row));
        if let Some(item) = &stored {
            self.cas.observe(item.cas);
        }
        Ok(Lookup {
            present: stored.is_some(),
            item: live(stored, self.clock.now()),
        })
    }

    fn write_back(
        &self,
        cursors: &CursorSet,
        key: &[u8],
        present: bool,
        item: &CacheItem,
    ) -> Result<()> {
        let row = self.mapping.item_to_row(item);
        if present {
            self.store_ref().update_row(cursors.search(), key, row)
        } else {
            self.store_ref().insert_row(cursors.primary, row)
        }
    }

    fn append(&self, op: LogOp) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let record = LogRecord {
            table: self.mapping.table().clone(),
            op,
        };
        log.append(record).map_err(|e| {
            warn!(target: "rowcache::engine", table = %self.mapping.table(), error = %e, "Durability log append failed");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcache_concurrency::{BatchPolicy, CookieTable, CursorTarget, Registry};
    use rowcache_core::{
        ColumnDef, IndexSpec, IsolationLevel, LockMode, TableDef, TableMapping, TableName,
    };
    use rowcache_storage::{MemDurabilityLog, MemRowStore};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct FixedClock(AtomicU64);

    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    const NOW: u64 = 1_700_000_000;

    fn table() -> TableName {
        TableName::new("test", "demo_test")
    }

    fn mapping(index: &str) -> TableMapping {
        TableMapping {
            database: "test".into(),
            table: "demo_test".into(),
            key_column: "c1".into(),
            value_columns: vec!["c2".into()],
            flags_column: Some("c3".into()),
            cas_column: Some("c4".into()),
            expire_column: Some("c5".into()),
            index: index.into(),
            separator: "|".into(),
        }
    }

    struct Fixture {
        translator: Translator,
        store: Arc<MemRowStore>,
        clock: Arc<FixedClock>,
        log: Arc<MemDurabilityLog>,
    }

    fn fixture(policy: BatchPolicy) -> Fixture {
        fixture_with(policy, mapping("PRIMARY"))
    }

    fn fixture_with(policy: BatchPolicy, table_mapping: TableMapping) -> Fixture {
        let store = Arc::new(MemRowStore::with_lock_wait(Duration::from_millis(10)));
        let def = TableDef::new(
            table(),
            vec![
                ColumnDef::bytes("c1"),
                ColumnDef::bytes("c2"),
                ColumnDef::uint("c3"),
                ColumnDef::uint("c4"),
                ColumnDef::uint("c5"),
            ],
            0,
        );
        store.create_table(def.clone()).unwrap();
        let resolved = table_mapping.resolve(&def).unwrap();

        let registry = Registry::new(store.clone(), Arc::new(CookieTable::new()));
        let target = CursorTarget::new(table(), IndexSpec::Primary);
        let lifecycle = LifecycleManager::new(registry, target, policy);
        let clock = Arc::new(FixedClock(AtomicU64::new(NOW)));
        let log = Arc::new(MemDurabilityLog::new());
        let translator = Translator::new(
            lifecycle,
            resolved,
            Arc::new(CasAllocator::new()),
            clock.clone(),
            Some(log.clone()),
        );
        Fixture {
            translator,
            store,
            clock,
            log,
        }
    }

    fn conn() -> ConnectionId {
        ConnectionId::new(1)
    }

    #[test]
    fn test_set_then_get() {
        let f = fixture(BatchPolicy::default());
        let cas = f
            .translator
            .store(conn(), CacheItem::new("k", "v").with_flags(9), StoreOp::Set)
            .unwrap();
        let item = f.translator.get(conn(), b"k").unwrap();
        assert_eq!(item.value, b"v");
        assert_eq!(item.flags, 9);
        assert_eq!(item.cas, cas);
    }

    #[test]
    fn test_without_cas_column_tokens_are_zero() {
        let mut table_mapping = mapping("PRIMARY");
        table_mapping.cas_column = None;
        let f = fixture_with(BatchPolicy::default(), table_mapping);

        let cas = f
            .translator
            .store(conn(), CacheItem::new("k", "1"), StoreOp::Set)
            .unwrap();
        assert_eq!(cas, 0);
        assert_eq!(f.translator.get(conn(), b"k").unwrap().cas, 0);

        let next = f
            .translator
            .store(conn(), CacheItem::new("k", "2").with_cas(cas), StoreOp::Cas)
            .unwrap();
        assert_eq!(next, 0);
        assert_eq!(f.translator.get(conn(), b"k").unwrap().value, b"2");

        let outcome = f
            .translator
            .arithmetic(conn(), b"k", &ArithmeticRequest::incr(3))
            .unwrap();
        assert_eq!(outcome.value, 5);
        assert_eq!(outcome.item.cas, 0);
    }

    #[test]
    fn test_add_replace_semantics() {
        let f = fixture(BatchPolicy::default());
        assert!(matches!(
            f.translator.store(conn(), CacheItem::new("k", "v"), StoreOp::Replace),
            Err(Error::NotStored)
        ));
        f.translator
            .store(conn(), CacheItem::new("k", "v"), StoreOp::Add)
            .unwrap();
        assert!(matches!(
            f.translator.store(conn(), CacheItem::new("k", "w"), StoreOp::Add),
            Err(Error::NotStored)
        ));
        f.translator
            .store(conn(), CacheItem::new("k", "w"), StoreOp::Replace)
            .unwrap();
        assert_eq!(f.translator.get(conn(), b"k").unwrap().value, b"w");
    }

    #[test]
    fn test_append_keeps_flags() {
        let f = fixture(BatchPolicy::default());
        f.translator
            .store(conn(), CacheItem::new("k", "mid").with_flags(3), StoreOp::Set)
            .unwrap();
        f.translator
            .store(conn(), CacheItem::new("k", "-end"), StoreOp::Append)
            .unwrap();
        f.translator
            .store(conn(), CacheItem::new("k", "start-"), StoreOp::Prepend)
            .unwrap();
        let item = f.translator.get(conn(), b"k").unwrap();
        assert_eq!(item.value, b"start-mid-end");
        assert_eq!(item.flags, 3);
    }

    #[test]
    fn test_cas_mismatch_is_exists() {
        let f = fixture(BatchPolicy::default());
        let cas = f
            .translator
            .store(conn(), CacheItem::new("k", "v"), StoreOp::Set)
            .unwrap();
        assert!(matches!(
            f.translator
                .store(conn(), CacheItem::new("k", "x").with_cas(cas + 100), StoreOp::Cas),
            Err(Error::Exists)
        ));
        let next = f
            .translator
            .store(conn(), CacheItem::new("k", "x").with_cas(cas), StoreOp::Cas)
            .unwrap();
        assert!(next > cas);
    }

    #[test]
    fn test_expired_row_is_absent_and_overwritten() {
        let f = fixture(BatchPolicy::default());
        f.translator
            .store(
                conn(),
                CacheItem::new("k", "old").with_expiration(NOW + 10),
                StoreOp::Set,
            )
            .unwrap();
        f.clock.0.store(NOW + 11, Ordering::Relaxed);

        assert!(matches!(f.translator.get(conn(), b"k"), Err(Error::NotFound)));
        assert!(matches!(
            f.translator.delete(conn(), b"k", 0),
            Err(Error::NotFound)
        ));
        f.translator
            .store(conn(), CacheItem::new("k", "new"), StoreOp::Add)
            .unwrap();
        assert_eq!(f.translator.get(conn(), b"k").unwrap().value, b"new");
        assert_eq!(f.store.row_count(&table()), 1);
    }

    #[test]
    fn test_delete_checks_cas() {
        let f = fixture(BatchPolicy::default());
        let cas = f
            .translator
            .store(conn(), CacheItem::new("k", "v"), StoreOp::Set)
            .unwrap();
        assert!(matches!(
            f.translator.delete(conn(), b"k", cas + 1),
            Err(Error::Exists)
        ));
        f.translator.delete(conn(), b"k", cas).unwrap();
        assert!(matches!(f.translator.get(conn(), b"k"), Err(Error::NotFound)));
    }

    #[test]
    fn test_arithmetic() {
        let f = fixture(BatchPolicy::default());
        assert!(matches!(
            f.translator
                .arithmetic(conn(), b"n", &ArithmeticRequest::incr(1)),
            Err(Error::NotFound)
        ));
        let created = f
            .translator
            .arithmetic(conn(), b"n", &ArithmeticRequest::incr(1).or_create(10, 0))
            .unwrap();
        assert_eq!(created.value, 10);

        let next = f
            .translator
            .arithmetic(conn(), b"n", &ArithmeticRequest::incr(5))
            .unwrap();
        assert_eq!(next.value, 15);
        let down = f
            .translator
            .arithmetic(conn(), b"n", &ArithmeticRequest::decr(100))
            .unwrap();
        assert_eq!(down.value, 0);
        assert_eq!(f.translator.get(conn(), b"n").unwrap().value, b"0");

        f.translator
            .store(conn(), CacheItem::new("s", "abc"), StoreOp::Set)
            .unwrap();
        assert!(matches!(
            f.translator
                .arithmetic(conn(), b"s", &ArithmeticRequest::incr(1)),
            Err(Error::NonNumeric)
        ));
    }

    #[test]
    fn test_cas_allocator_observes_stored_tokens() {
        let f = fixture(BatchPolicy::default());
        // Seed a row written by someone else
        let row = f
            .translator
            .mapping()
            .item_to_row(&CacheItem::new("old", "v").with_cas(5_000));
        let txn = f
            .store
            .begin_transaction(IsolationLevel::ReadUncommitted)
            .unwrap();
        let cursor = f
            .store
            .open_cursor(&table(), &IndexSpec::Primary, txn, LockMode::IntentExclusive)
            .unwrap();
        f.store.insert_row(cursor, row).unwrap();
        f.store.close_cursor(cursor).unwrap();
        f.store.commit(txn).unwrap();

        assert_eq!(f.translator.get(conn(), b"old").unwrap().cas, 5_000);
        let cas = f
            .translator
            .store(conn(), CacheItem::new("k", "v"), StoreOp::Set)
            .unwrap();
        assert!(cas > 5_000);
    }

    #[test]
    fn test_mutations_are_logged_in_order() {
        let f = fixture(BatchPolicy::new(0, 0, true));
        f.translator
            .store(conn(), CacheItem::new("a", "1"), StoreOp::Set)
            .unwrap();
        f.translator
            .arithmetic(conn(), b"a", &ArithmeticRequest::incr(1))
            .unwrap();
        f.translator.delete(conn(), b"a", 0).unwrap();
        let _ = f.translator.store(conn(), CacheItem::new("a", "x"), StoreOp::Replace);
        f.translator.flush(conn()).unwrap();

        let ops: Vec<LogOp> = f.log.records().into_iter().map(|r| r.op).collect();
        assert_eq!(
            ops,
            vec![
                LogOp::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec()
                },
                LogOp::Put {
                    key: b"a".to_vec(),
                    value: b"2".to_vec()
                },
                LogOp::Delete { key: b"a".to_vec() },
                LogOp::Truncate,
            ]
        );
    }

    #[test]
    fn test_failed_verb_still_releases_state() {
        let f = fixture(BatchPolicy::default());
        assert!(f.translator.get(conn(), b"missing").is_err());
        // The state is idle again, so the next verb does not see ConnectionBusy
        f.translator
            .store(conn(), CacheItem::new("k", "v"), StoreOp::Set)
            .unwrap();
    }
}
