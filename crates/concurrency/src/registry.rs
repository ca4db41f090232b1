//! Connection state registry
//!
//! Process-wide mapping from connection identity to per-connection state.
//!
//! ## Locking
//!
//! One `parking_lot::Mutex` guards the registry. Everything that must run
//! under it is a method on [`RegistryGuard`], the capability returned by
//! [`Registry::lock`]. Callers that need several steps under one hold (the
//! table flush) take the guard once and call the steps on it; nothing can
//! forget to lock or lock twice.
//!
//! ## Staleness
//!
//! A state is stale when its identity's binding no longer names it: the
//! connection closed (binding cleared) or closed and reopened (binding
//! names a newer state). Stale states are reclaimed by
//! [`RegistryGuard::clean`], which also runs opportunistically when the
//! registry grows past its high-water mark.

use crate::state::{ConnectionLease, ConnectionState};
use parking_lot::{Mutex, MutexGuard};
use rowcache_core::{
    ConnectionBindings, ConnectionId, Error, Result, RowStore, StateId, TableLocker,
};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Registry size above which creating a state first reclaims stale ones
pub const DEFAULT_HIGH_WATER: usize = 2048;

#[derive(Debug, Default)]
struct RegistryInner {
    states: FxHashMap<StateId, Arc<ConnectionState>>,
    by_identity: FxHashMap<ConnectionId, StateId>,
}

/// Registry of connection states
pub struct Registry {
    inner: Mutex<RegistryInner>,
    store: Arc<dyn RowStore>,
    bindings: Arc<dyn ConnectionBindings>,
    locker: Option<Arc<dyn TableLocker>>,
    high_water: usize,
    teardown_failures: AtomicU64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("high_water", &self.high_water)
            .field("has_locker", &self.locker.is_some())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new(store: Arc<dyn RowStore>, bindings: Arc<dyn ConnectionBindings>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            store,
            bindings,
            locker: None,
            high_water: DEFAULT_HIGH_WATER,
            teardown_failures: AtomicU64::new(0),
        }
    }

    /// Release SQL-layer table locks through `locker` on teardown
    pub fn with_locker(mut self, locker: Arc<dyn TableLocker>) -> Self {
        self.locker = Some(locker);
        self
    }

    /// Override the opportunistic cleanup threshold
    pub fn with_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water;
        self
    }

    /// Take the registry lock
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            registry: self,
            inner: self.inner.lock(),
        }
    }

    /// Row store the states' handles belong to
    pub fn store(&self) -> &dyn RowStore {
        self.store.as_ref()
    }

    /// Connection bindings
    pub fn bindings(&self) -> &dyn ConnectionBindings {
        self.bindings.as_ref()
    }

    /// SQL-layer table locker, if configured
    pub fn locker(&self) -> Option<&dyn TableLocker> {
        self.locker.as_deref()
    }

    /// Cleanup threshold
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Number of tracked states
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no state is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the state bound to `identity`, creating one if needed
    pub fn create_or_get(&self, identity: ConnectionId) -> Result<ConnectionLease> {
        self.lock().create_or_get(identity)
    }

    /// Reclaim stale states, or every state when `clear_all`
    pub fn clean(&self, clear_all: bool) -> usize {
        self.lock().clean(clear_all)
    }

    /// Total teardown failures logged so far
    pub fn teardown_failures(&self) -> u64 {
        self.teardown_failures.load(Ordering::Relaxed)
    }

    fn is_stale(&self, state: &ConnectionState) -> bool {
        self.bindings.binding(state.identity()) != Some(state.id())
    }
}

/// Proof that the registry lock is held
///
/// Dropping the guard releases the lock.
pub struct RegistryGuard<'a> {
    registry: &'a Registry,
    inner: MutexGuard<'a, RegistryInner>,
}

impl<'a> RegistryGuard<'a> {
    /// Number of tracked states
    pub fn len(&self) -> usize {
        self.inner.states.len()
    }

    /// True if no state is tracked
    pub fn is_empty(&self) -> bool {
        self.inner.states.is_empty()
    }

    /// The registry this guard locks
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// State currently bound to `identity`
    pub fn bound_state(&self, identity: ConnectionId) -> Option<Arc<ConnectionState>> {
        let id = self.registry.bindings.binding(identity)?;
        self.inner.states.get(&id).cloned()
    }

    /// Claim the state bound to `identity`, creating one if needed
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionBusy` if the bound state is already in use
    /// - `Error::OutOfMemory` if the registry cannot grow; nothing is
    ///   modified in that case
    pub fn create_or_get(&mut self, identity: ConnectionId) -> Result<ConnectionLease> {
        if let Some(state) = self.bound_state(identity) {
            if !state.try_claim() {
                return Err(Error::ConnectionBusy(identity));
            }
            return Ok(ConnectionLease::new(state));
        }

        if self.inner.states.len() > self.registry.high_water {
            let removed = self.clean(false);
            debug!(target: "rowcache::conn", removed, "Registry over high-water mark, reclaimed stale states");
        }

        self.inner
            .states
            .try_reserve(1)
            .map_err(|e| Error::OutOfMemory(format!("connection registry: {}", e)))?;
        self.inner
            .by_identity
            .try_reserve(1)
            .map_err(|e| Error::OutOfMemory(format!("connection identity index: {}", e)))?;

        let state = Arc::new(ConnectionState::new(identity));
        let claimed = state.try_claim();
        debug_assert!(claimed);

        self.inner.states.insert(state.id(), Arc::clone(&state));
        self.inner.by_identity.insert(identity, state.id());
        self.registry.bindings.bind(identity, Some(state.id()));
        trace!(target: "rowcache::conn", %identity, state = %state.id(), "Created connection state");
        Ok(ConnectionLease::new(state))
    }

    /// Reclaim stale states, or every state when `clear_all`
    ///
    /// A state is eligible if `clear_all`, or if it is idle and stale. Each
    /// eligible state is removed, its handles released (teardown failures
    /// are logged and counted, never fatal) and, when `clear_all`, its
    /// identity's binding cleared. Returns the number of states removed.
    pub fn clean(&mut self, clear_all: bool) -> usize {
        let registry = self.registry;
        let eligible: Vec<StateId> = self
            .inner
            .states
            .values()
            .filter(|s| clear_all || (!s.is_in_use() && registry.is_stale(s)))
            .map(|s| s.id())
            .collect();

        let mut removed = 0;
        for id in eligible {
            if self.reclaim(id, clear_all) {
                removed += 1;
            }
        }

        debug_assert!(!clear_all || self.inner.states.is_empty());
        if removed > 0 {
            debug!(target: "rowcache::conn", removed, clear_all, remaining = self.len(), "Cleaned connection states");
        }
        removed
    }

    /// Remove one state and release its handles
    ///
    /// Returns false if `id` is not tracked.
    pub fn reclaim(&mut self, id: StateId, clear_binding: bool) -> bool {
        let Some(state) = self.inner.states.remove(&id) else {
            return false;
        };
        let identity = state.identity();
        if self.inner.by_identity.get(&identity) == Some(&id) {
            self.inner.by_identity.remove(&identity);
        }

        let failures = state.teardown(self.registry.store(), self.registry.locker());
        if failures > 0 {
            self.registry
                .teardown_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }

        if clear_binding && self.registry.bindings.binding(identity) == Some(id) {
            self.registry.bindings.bind(identity, None);
        }
        trace!(target: "rowcache::conn", %identity, state = %id, "Reclaimed connection state");
        true
    }

    /// The connection closed: clear its binding and reclaim its latest
    /// state now unless an operation still holds it
    ///
    /// A held state stays tracked as stale and is reclaimed by a later
    /// cleanup. Returns true if a state was reclaimed.
    pub fn release_identity(&mut self, identity: ConnectionId) -> bool {
        self.registry.bindings.bind(identity, None);
        let Some(id) = self.inner.by_identity.get(&identity).copied() else {
            return false;
        };
        let idle = self
            .inner
            .states
            .get(&id)
            .map_or(false, |state| !state.is_in_use());
        idle && self.reclaim(id, false)
    }

    /// Id of the newest state created for `identity`
    pub fn latest_for(&self, identity: ConnectionId) -> Option<StateId> {
        self.inner.by_identity.get(&identity).copied()
    }

    /// State with id `id`
    pub fn get(&self, id: StateId) -> Option<Arc<ConnectionState>> {
        self.inner.states.get(&id).cloned()
    }
}
