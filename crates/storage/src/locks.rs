//! Table-level lock bookkeeping for the in-memory row store
//!
//! Each table tracks the strongest mode held by every transaction. A
//! request is granted when the resulting mode is compatible with the
//! modes held by all *other* transactions. Waiting is done by the caller
//! (see `MemRowStore`); this type only answers "can it be granted now".

use rowcache_core::{LockMode, TxnHandle};
use rustc_hash::FxHashMap;

/// Locks held on one table
#[derive(Debug, Default)]
pub struct TableLocks {
    held: FxHashMap<TxnHandle, LockMode>,
}

impl TableLocks {
    /// Create an empty lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode held by `txn`, if any
    pub fn held_by(&self, txn: TxnHandle) -> Option<LockMode> {
        self.held.get(&txn).copied()
    }

    /// Mode `txn` would hold after being granted `requested`
    ///
    /// A request already covered by the held mode changes nothing. Two
    /// modes that do not cover each other (IX + S) escalate to X.
    pub fn target_mode(&self, txn: TxnHandle, requested: LockMode) -> LockMode {
        match self.held_by(txn) {
            None => requested,
            Some(held) if held.covers(requested) => held,
            Some(held) if requested.covers(held) => requested,
            Some(_) => LockMode::Exclusive,
        }
    }

    /// True if `txn` can hold `mode` alongside every other holder
    pub fn can_grant(&self, txn: TxnHandle, mode: LockMode) -> bool {
        self.held
            .iter()
            .filter(|(holder, _)| **holder != txn)
            .all(|(_, held)| mode.is_compatible_with(*held))
    }

    /// Record `txn` as holding `mode`
    pub fn grant(&mut self, txn: TxnHandle, mode: LockMode) {
        self.held.insert(txn, mode);
    }

    /// Drop whatever `txn` holds; returns true if it held anything
    pub fn release(&mut self, txn: TxnHandle) -> bool {
        self.held.remove(&txn).is_some()
    }

    /// Current holders, sorted by transaction
    pub fn holders(&self) -> Vec<(TxnHandle, LockMode)> {
        let mut out: Vec<_> = self.held.iter().map(|(t, m)| (*t, *m)).collect();
        out.sort();
        out
    }

    /// True when no transaction holds a lock
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
