//! Integration tests for the connection lifecycle
//!
//! These tests drive LifecycleManager against MemRowStore and verify:
//! - Opportunistic cleanup at the registry high-water mark
//! - Stale-state reclamation after a connection closes and reopens
//! - Batched commit boundaries (N-1 still open, N committed)
//! - Cursor reuse without ever touching a detached cursor
//! - Forced cleanup releasing every handle exactly once
//! - Distinct connections not serializing on row-store waits

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use rowcache_concurrency::{
    BatchPolicy, CookieTable, CursorTarget, LifecycleManager, Registry, DEFAULT_HIGH_WATER,
};
use rowcache_core::{
    AccessIntent, Column, ColumnDef, ConnectionBindings, ConnectionId, IndexSpec,
    IsolationLevel, LockMode, OpKind, Row, RowStore, TableDef, TableName,
};
use rowcache_storage::MemRowStore;

// ============================================================================
// Test Helpers
// ============================================================================

fn demo() -> TableName {
    TableName::new("test", "demo")
}

struct Env {
    manager: LifecycleManager,
    store: Arc<MemRowStore>,
    cookies: Arc<CookieTable>,
}

fn env_with(index: IndexSpec, policy: BatchPolicy, lock_wait: Duration) -> Env {
    let store = Arc::new(MemRowStore::with_lock_wait(lock_wait));
    store
        .create_table(
            TableDef::new(
                demo(),
                vec![
                    ColumnDef::bytes("k"),
                    ColumnDef::bytes("v"),
                    ColumnDef::bytes("alt"),
                ],
                0,
            )
            .with_secondary_index("by_alt", 2),
        )
        .unwrap();
    let cookies = Arc::new(CookieTable::new());
    let registry = Registry::new(store.clone(), cookies.clone());
    let manager = LifecycleManager::new(registry, CursorTarget::new(demo(), index), policy);
    Env {
        manager,
        store,
        cookies,
    }
}

fn env(policy: BatchPolicy) -> Env {
    env_with(IndexSpec::Primary, policy, Duration::from_millis(20))
}

fn row(k: &str, v: &str) -> Row {
    Row::new(vec![
        Column::Bytes(k.as_bytes().to_vec()),
        Column::Bytes(v.as_bytes().to_vec()),
        Column::Bytes(format!("alt-{}", k).into_bytes()),
    ])
}

// ============================================================================
// Registry growth and staleness
// ============================================================================

#[test]
fn test_cleanup_runs_past_high_water_mark() {
    let env = env(BatchPolicy::default());
    let total = DEFAULT_HIGH_WATER as u64 + 1;

    for i in 0..total {
        let conn = ConnectionId::new(i);
        drop(env.manager.acquire(conn, AccessIntent::read()).unwrap());
        if i % 2 == 0 {
            env.cookies.close(conn);
        }
    }
    assert_eq!(env.manager.registry().len(), total as usize);

    let closed = (total as usize + 1) / 2;
    drop(
        env.manager
            .acquire(ConnectionId::new(total), AccessIntent::read())
            .unwrap(),
    );
    let remaining = total as usize - closed + 1;
    assert_eq!(env.manager.registry().len(), remaining);
    assert_eq!(env.store.stats().cursors_open(), remaining as u64);
}

#[test]
fn test_no_cleanup_at_high_water_mark() {
    let env = env(BatchPolicy::default());
    let registry = env.manager.registry();
    for i in 0..DEFAULT_HIGH_WATER as u64 {
        let conn = ConnectionId::new(i);
        drop(registry.create_or_get(conn).unwrap());
        env.cookies.close(conn);
    }
    drop(registry.create_or_get(ConnectionId::new(9_999)).unwrap());
    assert_eq!(registry.len(), DEFAULT_HIGH_WATER + 1);
}

#[test]
fn test_reopened_connection_reclaims_only_old_state() {
    let env = env(BatchPolicy::default());
    let conn = ConnectionId::new(7);

    let lease = env.manager.acquire(conn, AccessIntent::write()).unwrap();
    let old = lease.state().snapshot();
    let old_id = lease.state().id();
    drop(lease);

    env.cookies.close(conn);
    let lease = env.manager.acquire(conn, AccessIntent::read()).unwrap();
    let new = lease.state().snapshot();
    assert_ne!(lease.state().id(), old_id);
    drop(lease);

    assert_eq!(env.manager.registry().clean(false), 1);
    assert!(!env.store.is_transaction_active(old.read_txn.unwrap()));
    assert!(!env.store.is_transaction_active(old.write_txn.unwrap()));
    assert!(!env.store.is_cursor_open(old.write_cursor.unwrap()));
    assert!(env.store.is_transaction_active(new.read_txn.unwrap()));
    assert!(env.store.is_cursor_open(new.read_cursor.unwrap()));
    let latest = env.manager.registry().lock().latest_for(conn);
    assert_eq!(env.cookies.binding(conn), latest);
}

// ============================================================================
// Batched commit
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_read_batch_boundary(n in 1u64..12, ops in 1u64..30) {
        let env = env(BatchPolicy::new(n, 0, false));
        let conn = ConnectionId::new(1);
        let mut last_txn = None;
        for _ in 0..ops {
            let lease = env.manager.acquire(conn, AccessIntent::read()).unwrap();
            last_txn = lease.state().snapshot().read_txn;
            env.manager.reset_for(lease, OpKind::Read).unwrap();
        }
        let state = env.manager.registry().lock().bound_state(conn).unwrap();
        let handles = state.snapshot();
        prop_assert_eq!(handles.reads, ops % n);
        prop_assert_eq!(handles.read_txn.is_some(), ops % n != 0);
        let txn = last_txn.unwrap();
        prop_assert_eq!(env.store.is_transaction_active(txn), ops % n != 0);
        prop_assert_eq!(env.store.stats().cursors_opened, 1);
    }

    #[test]
    fn prop_write_batch_boundary(n in 1u64..12, ops in 1u64..30) {
        let env = env(BatchPolicy::new(0, n, false));
        let conn = ConnectionId::new(1);
        for i in 0..ops {
            let lease = env.manager.acquire(conn, AccessIntent::write()).unwrap();
            let kind = if i % 3 == 0 { OpKind::Delete } else { OpKind::Write };
            env.manager.reset_for(lease, kind).unwrap();
        }
        let handles = env.manager.registry().lock().bound_state(conn).unwrap().snapshot();
        prop_assert_eq!(handles.writes, ops % n);
        prop_assert_eq!(handles.write_txn.is_some(), ops % n != 0);
        prop_assert!(handles.write_cursor.is_some());
        // The read path is untouched by writes
        prop_assert!(handles.read_txn.is_some());
    }
}

#[test]
fn test_durability_log_commits_every_write() {
    let env = env(BatchPolicy::new(0, 500, true));
    let conn = ConnectionId::new(1);
    for _ in 0..3 {
        let lease = env.manager.acquire(conn, AccessIntent::write()).unwrap();
        let txn = lease.write_txn().unwrap();
        env.manager.reset_for(lease, OpKind::Write).unwrap();
        assert!(!env.store.is_transaction_active(txn));
    }
    let handles = env
        .manager
        .registry()
        .lock()
        .bound_state(conn)
        .unwrap()
        .snapshot();
    assert_eq!(handles.writes, 0);
    assert!(handles.write_txn.is_none());
    assert!(handles.write_cursor.is_some());
}

#[test]
fn test_cursors_are_reattached_before_use() {
    let env = env_with(
        IndexSpec::Secondary("by_alt".into()),
        BatchPolicy::new(3, 2, false),
        Duration::from_millis(20),
    );
    let conn = ConnectionId::new(1);
    for i in 0..50 {
        let key = format!("k{}", i % 7);
        if i % 4 == 0 {
            let lease = env.manager.acquire(conn, AccessIntent::read()).unwrap();
            let cursors = lease.read_cursors().unwrap();
            env.store
                .read_row(cursors.search(), format!("alt-{}", key).as_bytes())
                .unwrap();
            env.manager.reset_for(lease, OpKind::Read).unwrap();
        } else {
            let lease = env.manager.acquire(conn, AccessIntent::write()).unwrap();
            let cursors = lease.write_cursors().unwrap();
            let search = format!("alt-{}", key);
            if env.store.read_row(cursors.search(), search.as_bytes()).unwrap().is_some() {
                env.store
                    .update_row(cursors.search(), search.as_bytes(), row(&key, "u"))
                    .unwrap();
            } else {
                env.store.insert_row(cursors.primary, row(&key, "i")).unwrap();
            }
            env.manager.reset_for(lease, OpKind::Write).unwrap();
        }
    }
    // One cursor per index per path, all reused
    assert_eq!(env.store.stats().cursors_opened, 4);
    assert_eq!(env.store.row_count(&demo()), 7);
}

// ============================================================================
// Forced cleanup
// ============================================================================

#[test]
fn test_clear_all_releases_every_handle_once() {
    let env = env_with(
        IndexSpec::Secondary("by_alt".into()),
        BatchPolicy::new(2, 2, false),
        Duration::from_millis(20),
    );
    for i in 0..20 {
        let conn = ConnectionId::new(i);
        let intent = if i % 2 == 0 {
            AccessIntent::write()
        } else {
            AccessIntent::read()
        };
        let lease = env.manager.acquire(conn, intent).unwrap();
        if i % 3 == 0 {
            env.manager.reset_for(lease, OpKind::Read).unwrap();
        }
    }

    assert_eq!(env.manager.registry().clean(true), 20);
    assert!(env.manager.registry().is_empty());
    assert!(env.cookies.is_empty());
    assert_eq!(env.manager.registry().teardown_failures(), 0);

    let stats = env.store.stats();
    assert_eq!(stats.cursors_opened, stats.cursors_closed);
    assert_eq!(stats.txns_active(), 0);
    assert_eq!(stats.txns_rolled_back, 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_distinct_connections_run_concurrently() {
    let env = Arc::new(env(BatchPolicy::new(8, 4, false)));
    let threads = 8;
    let ops = 200;
    let barrier = Arc::new(Barrier::new(threads));
    let failures = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let env = Arc::clone(&env);
            let barrier = Arc::clone(&barrier);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                let conn = ConnectionId::new(t as u64);
                barrier.wait();
                for i in 0..ops {
                    let key = format!("t{}-{}", t, i % 10);
                    let result = (|| -> rowcache_core::Result<()> {
                        let lease = env.manager.acquire(conn, AccessIntent::write())?;
                        let cursors = lease.write_cursors()?;
                        if env.store.read_row(cursors.primary, key.as_bytes())?.is_none() {
                            env.store.insert_row(cursors.primary, row(&key, "v"))?;
                        }
                        env.manager.reset_for(lease, OpKind::Write)
                    })();
                    if result.is_err() {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(failures.load(Ordering::Relaxed), 0);
    assert_eq!(env.manager.registry().len(), threads);
    assert_eq!(env.store.row_count(&demo()), threads * 10);
    assert_eq!(env.manager.shutdown(), threads);
    assert_eq!(env.store.stats().cursors_open(), 0);
}

#[test]
fn test_row_store_wait_does_not_block_other_connections() {
    let env = Arc::new(env_with(
        IndexSpec::Primary,
        BatchPolicy::default(),
        Duration::from_secs(5),
    ));

    // An outside reader holds S: readers still get in, writers must wait
    let outside = env
        .store
        .begin_transaction(IsolationLevel::ReadUncommitted)
        .unwrap();
    env.store
        .open_cursor(&demo(), &IndexSpec::Primary, outside, LockMode::Shared)
        .unwrap();

    let writer = {
        let env = Arc::clone(&env);
        thread::spawn(move || {
            let lease = env
                .manager
                .acquire(ConnectionId::new(1), AccessIntent::write())?;
            env.manager.reset_for(lease, OpKind::Write)
        })
    };

    // Give the writer time to block inside the row store
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    let lease = env
        .manager
        .acquire(ConnectionId::new(2), AccessIntent::read())
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    env.manager.reset_for(lease, OpKind::Read).unwrap();
    assert!(!writer.is_finished());

    env.store.commit(outside).unwrap();
    writer.join().unwrap().unwrap();
}
