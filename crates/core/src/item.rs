//! Cache item semantics
//!
//! The row store knows nothing about CAS tokens, expiration or the
//! conditional store verbs. The functions here decide, from the currently
//! stored item (if any) and the request, what should be written back. Both
//! the row-store path and the fallback cache use them, so the two backends
//! cannot drift apart.
//!
//! ## Expiration
//!
//! Expiration times follow the cache protocol convention:
//! - `0` never expires
//! - values up to [`REALTIME_MAXDELTA`] are seconds relative to now
//! - larger values are absolute unix timestamps
//!
//! Items store the absolute form.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest expiration treated as relative (30 days)
pub const REALTIME_MAXDELTA: u64 = 60 * 60 * 24 * 30;

/// Convert a protocol expiration into an absolute unix time (0 = never)
pub fn absolute_expiration(exptime: u64, now: u64) -> u64 {
    match exptime {
        0 => 0,
        rel if rel <= REALTIME_MAXDELTA => now.saturating_add(rel),
        abs => abs,
    }
}

/// A cache item as seen by the protocol layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    /// Item key
    pub key: Vec<u8>,
    /// Item value
    pub value: Vec<u8>,
    /// Opaque client flags
    pub flags: u32,
    /// CAS token (0 = none)
    pub cas: u64,
    /// Absolute expiration in unix seconds (0 = never)
    pub expiration: u64,
}

impl CacheItem {
    /// Create an item with no flags, CAS or expiration
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: 0,
            cas: 0,
            expiration: 0,
        }
    }

    /// Set client flags
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Set the CAS token
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Set an absolute expiration
    pub fn with_expiration(mut self, expiration: u64) -> Self {
        self.expiration = expiration;
        self
    }

    /// True once `now` is past a non-zero expiration
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration != 0 && now > self.expiration
    }
}

/// Drop an item that has already expired
pub fn live(item: Option<CacheItem>, now: u64) -> Option<CacheItem> {
    item.filter(|it| !it.is_expired(now))
}

/// Store verbs of the cache protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// Store only if absent
    Add,
    /// Unconditional store
    Set,
    /// Store only if present
    Replace,
    /// Add data after the existing value
    Append,
    /// Add data before the existing value
    Prepend,
    /// Store only if the CAS token still matches
    Cas,
}

impl StoreOp {
    /// Protocol verb name
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Add => "add",
            StoreOp::Set => "set",
            StoreOp::Replace => "replace",
            StoreOp::Append => "append",
            StoreOp::Prepend => "prepend",
            StoreOp::Cas => "cas",
        }
    }
}

/// Process-wide CAS token allocator
///
/// Tokens start at 1 and increase monotonically; 0 is reserved for "no CAS".
#[derive(Debug)]
pub struct CasAllocator {
    next: AtomicU64,
}

impl CasAllocator {
    /// Create an allocator whose first token is 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh token
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future tokens are above `seen` (after loading persisted rows)
    pub fn observe(&self, seen: u64) {
        self.next.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for CasAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide what a store verb writes
///
/// `existing` must already be filtered for expiration (see [`live`]).
/// `incoming.expiration` is expected in absolute form. On success the
/// returned item carries `new_cas` and is what must be written.
pub fn apply_store(
    existing: Option<&CacheItem>,
    mut incoming: CacheItem,
    op: StoreOp,
    new_cas: u64,
) -> Result<CacheItem> {
    match (op, existing) {
        (StoreOp::Set, _) => {}
        (StoreOp::Add, Some(_)) => return Err(Error::NotStored),
        (StoreOp::Add, None) => {}
        (StoreOp::Replace, None) => return Err(Error::NotStored),
        (StoreOp::Replace, Some(_)) => {}
        (StoreOp::Append | StoreOp::Prepend, None) => return Err(Error::NotStored),
        (StoreOp::Append, Some(old)) => {
            let mut value = old.value.clone();
            value.extend_from_slice(&incoming.value);
            incoming = CacheItem {
                value,
                flags: old.flags,
                expiration: old.expiration,
                ..incoming
            };
        }
        (StoreOp::Prepend, Some(old)) => {
            let mut value = incoming.value;
            value.extend_from_slice(&old.value);
            incoming = CacheItem {
                value,
                flags: old.flags,
                expiration: old.expiration,
                ..incoming
            };
        }
        (StoreOp::Cas, None) => return Err(Error::NotFound),
        (StoreOp::Cas, Some(old)) => {
            if old.cas != incoming.cas {
                return Err(Error::Exists);
            }
        }
    }
    incoming.cas = new_cas;
    Ok(incoming)
}

/// Check the optional CAS token of a delete against the stored item
pub fn check_delete(existing: Option<&CacheItem>, cas: u64) -> Result<()> {
    match existing {
        None => Err(Error::NotFound),
        Some(old) if cas != 0 && old.cas != cas => Err(Error::Exists),
        Some(_) => Ok(()),
    }
}

/// Increment/decrement request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithmeticRequest {
    /// Increment if true, decrement otherwise
    pub increment: bool,
    /// Amount to add or subtract
    pub delta: u64,
    /// Create the item with `initial` when missing
    pub create: bool,
    /// Value stored when creating
    pub initial: u64,
    /// Protocol expiration applied when creating
    pub exptime: u64,
}

impl ArithmeticRequest {
    /// `incr key delta` without auto-create
    pub fn incr(delta: u64) -> Self {
        Self {
            increment: true,
            delta,
            create: false,
            initial: 0,
            exptime: 0,
        }
    }

    /// `decr key delta` without auto-create
    pub fn decr(delta: u64) -> Self {
        Self {
            increment: false,
            ..Self::incr(delta)
        }
    }

    /// Create missing items with `initial`
    pub fn or_create(mut self, initial: u64, exptime: u64) -> Self {
        self.create = true;
        self.initial = initial;
        self.exptime = exptime;
        self
    }
}

/// Result of an arithmetic operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArithmeticOutcome {
    /// New numeric value
    pub value: u64,
    /// Item to write back
    pub item: CacheItem,
}

/// Decide what an increment/decrement writes
///
/// Increment wraps at 2^64, decrement saturates at zero.
pub fn apply_arithmetic(
    key: &[u8],
    existing: Option<&CacheItem>,
    req: &ArithmeticRequest,
    now: u64,
    new_cas: u64,
) -> Result<ArithmeticOutcome> {
    let item = match existing {
        None if req.create => CacheItem {
            key: key.to_vec(),
            value: req.initial.to_string().into_bytes(),
            flags: 0,
            cas: new_cas,
            expiration: absolute_expiration(req.exptime, now),
        },
        None => return Err(Error::NotFound),
        Some(old) => {
            let current = parse_counter(&old.value)?;
            let next = if req.increment {
                current.wrapping_add(req.delta)
            } else {
                current.saturating_sub(req.delta)
            };
            CacheItem {
                value: next.to_string().into_bytes(),
                cas: new_cas,
                ..old.clone()
            }
        }
    };
    let value = parse_counter(&item.value)?;
    Ok(ArithmeticOutcome { value, item })
}

fn parse_counter(raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or(Error::NonNumeric)
}
