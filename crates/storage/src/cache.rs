//! In-memory fallback cache
//!
//! `MemCache` is the [`CacheStore`] consulted in cache-only and mixed
//! routing. Items live in a `DashMap`; every read-modify-write goes through
//! the map's entry API so it holds the shard lock for the whole decision.
//! The decision itself is made by the shared item functions in
//! `rowcache_core::item`, the same ones the row-store path uses.
//!
//! Expiration on the way in is expected in absolute form. Expired items are
//! treated as absent and dropped when touched.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rowcache_core::{
    apply_arithmetic, apply_store, check_delete, ArithmeticOutcome, ArithmeticRequest, CacheItem,
    CacheStore, CasAllocator, Clock, Error, Result, StoreOp, SystemClock,
};
use std::sync::Arc;

/// `DashMap`-backed [`CacheStore`]
pub struct MemCache {
    items: DashMap<Vec<u8>, CacheItem>,
    cas: Arc<CasAllocator>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCache")
            .field("items", &self.items.len())
            .finish()
    }
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCache {
    /// Create an empty cache with its own CAS allocator and the system clock
    pub fn new() -> Self {
        Self::with_parts(Arc::new(CasAllocator::new()), Arc::new(SystemClock))
    }

    /// Create an empty cache sharing a CAS allocator and clock
    pub fn with_parts(cas: Arc<CasAllocator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: DashMap::new(),
            cas,
            clock,
        }
    }

    /// Number of stored items, including expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl CacheStore for MemCache {
    fn get(&self, key: &[u8]) -> Option<CacheItem> {
        let now = self.clock.now();
        let item = self.items.get(key).map(|r| r.value().clone())?;
        if item.is_expired(now) {
            self.items.remove_if(key, |_, it| it.is_expired(now));
            return None;
        }
        Some(item)
    }

    fn store(&self, item: CacheItem, op: StoreOp) -> Result<u64> {
        let now = self.clock.now();
        match self.items.entry(item.key.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = Some(slot.get()).filter(|it| !it.is_expired(now));
                let written = apply_store(existing, item, op, self.cas.next())?;
                let cas = written.cas;
                slot.insert(written);
                Ok(cas)
            }
            Entry::Vacant(slot) => {
                let written = apply_store(None, item, op, self.cas.next())?;
                let cas = written.cas;
                slot.insert(written);
                Ok(cas)
            }
        }
    }

    fn delete(&self, key: &[u8], cas: u64) -> Result<()> {
        let now = self.clock.now();
        match self.items.entry(key.to_vec()) {
            Entry::Occupied(slot) => {
                if slot.get().is_expired(now) {
                    slot.remove();
                    return Err(Error::NotFound);
                }
                check_delete(Some(slot.get()), cas)?;
                slot.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(Error::NotFound),
        }
    }

    fn evict(&self, key: &[u8]) -> Option<CacheItem> {
        self.items.remove(key).map(|(_, item)| item)
    }

    fn arithmetic(&self, key: &[u8], req: &ArithmeticRequest) -> Result<ArithmeticOutcome> {
        let now = self.clock.now();
        match self.items.entry(key.to_vec()) {
            Entry::Occupied(mut slot) => {
                let existing = Some(slot.get()).filter(|it| !it.is_expired(now));
                let outcome = apply_arithmetic(key, existing, req, now, self.cas.next())?;
                slot.insert(outcome.item.clone());
                Ok(outcome)
            }
            Entry::Vacant(slot) => {
                let outcome = apply_arithmetic(key, None, req, now, self.cas.next())?;
                slot.insert(outcome.item.clone());
                Ok(outcome)
            }
        }
    }

    fn flush(&self) {
        self.items.clear();
    }
}
