//! Core types for rowcache
//!
//! This module defines the foundational types:
//! - ConnectionId: Opaque identity of a protocol connection (the "cookie")
//! - StateId: Process-unique identity of one per-connection state record
//! - TxnHandle / CursorHandle: Opaque row-store handles
//! - IsolationLevel / LockMode: Row-store transaction and lock parameters
//! - OpKind / AccessIntent: What an operation is about to do

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Identities
// ============================================================================

/// Opaque identity of a protocol connection
///
/// Supplied by the protocol layer. The engine only uses it as a lookup key
/// and never owns the connection behind it. The same value may be reused by
/// the protocol layer after a connection closes and a new one opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw connection identity
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identity value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identity of one per-connection state record
///
/// Allocated from a process-wide counter, so two states never share an id
/// even when they were created for the same [`ConnectionId`]. Staleness
/// detection relies on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

impl StateId {
    /// Allocate the next process-unique state id
    pub fn next() -> Self {
        Self(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Row-store transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnHandle(u64);

impl TxnHandle {
    /// Wrap a raw handle value (row-store implementations only)
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Row-store cursor handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorHandle(u64);

impl CursorHandle {
    /// Wrap a raw handle value (row-store implementations only)
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor#{}", self.0)
    }
}

// ============================================================================
// Transaction parameters
// ============================================================================

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Readers see uncommitted writes of other transactions
    ReadUncommitted,
    /// Readers see only committed writes
    ReadCommitted,
    /// Repeatable snapshot reads
    RepeatableRead,
    /// Full serializability
    Serializable,
}

/// Table lock modes with the usual intention-lock compatibility matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Intent to read rows
    IntentShared,
    /// Intent to modify rows
    IntentExclusive,
    /// Whole-table read
    Shared,
    /// Whole-table exclusive access (flush/truncate)
    Exclusive,
}

impl LockMode {
    /// Check if a lock in `self` mode can coexist with one held in `other`
    pub fn is_compatible_with(&self, other: LockMode) -> bool {
        use LockMode::*;
        match (*self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, Shared) => true,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => false,
        }
    }

    /// True for the table-level exclusive mode
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockMode::Exclusive)
    }

    /// True if `self` grants at least the access of `other`
    pub fn covers(&self, other: LockMode) -> bool {
        use LockMode::*;
        match (*self, other) {
            (a, b) if a == b => true,
            (Exclusive, _) => true,
            (IntentExclusive, IntentShared) => true,
            (Shared, IntentShared) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Operation classification
// ============================================================================

/// Class of a completed unit of work, used by batched commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Lookup
    Read,
    /// Insert/update (store verbs, arithmetic)
    Write,
    /// Row delete
    Delete,
    /// Table flush: commit and fully reset both paths
    Flush,
}

impl OpKind {
    /// True for kinds counted against the write batch
    pub fn is_mutation(&self) -> bool {
        matches!(self, OpKind::Write | OpKind::Delete)
    }
}

/// What an operation needs from its connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessIntent {
    /// Operation modifies rows and needs the write path
    pub mutating: bool,
    /// Lock mode requested on the table
    pub lock_mode: LockMode,
}

impl AccessIntent {
    /// Read-only access (get)
    pub const fn read() -> Self {
        Self {
            mutating: false,
            lock_mode: LockMode::IntentShared,
        }
    }

    /// Row-level mutation (store, delete, arithmetic)
    pub const fn write() -> Self {
        Self {
            mutating: true,
            lock_mode: LockMode::IntentExclusive,
        }
    }

    /// Table-level exclusive access (flush)
    pub const fn exclusive() -> Self {
        Self {
            mutating: true,
            lock_mode: LockMode::Exclusive,
        }
    }
}
