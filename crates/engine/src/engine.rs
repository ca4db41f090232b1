//! The cache engine
//!
//! [`CacheEngine`] is what the protocol layer talks to. It is built once at
//! startup by [`EngineBuilder`], which resolves the table mapping against
//! the row store, creates the connection registry and lifecycle manager,
//! and wires in the optional collaborators (cache, SQL table locker,
//! durability log).
//!
//! # Example
//!
//! ```ignore
//! use rowcache_engine::{CacheEngine, EngineConfig};
//!
//! let engine = CacheEngine::builder(store, cookies)
//!     .config(EngineConfig::from_file(path)?)
//!     .open()?;
//!
//! engine.store(conn, CacheItem::new("k", "v"), StoreOp::Set)?;
//! let item = engine.get(conn, b"k")?;
//! ```

use crate::config::{EngineConfig, CONFIG_FILE_NAME};
use crate::routing::{Dispatcher, Routing};
use crate::translator::Translator;
use rowcache_concurrency::{CursorTarget, LifecycleManager, Registry};
use rowcache_core::{
    absolute_expiration, ArithmeticOutcome, ArithmeticRequest, CacheItem, CacheStore,
    CasAllocator, Clock, ConnectionBindings, ConnectionId, DurabilityLog, Error, ResolvedMapping,
    Result, RowStore, StoreOp, SystemClock, TableLocker,
};
use rowcache_storage::MemCache;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Builder
// ============================================================================

/// Startup wiring for a [`CacheEngine`]
///
/// The row store and the connection bindings are required; everything
/// else has a default.
pub struct EngineBuilder {
    store: Arc<dyn RowStore>,
    bindings: Arc<dyn ConnectionBindings>,
    config: EngineConfig,
    cache: Option<Arc<dyn CacheStore>>,
    locker: Option<Arc<dyn TableLocker>>,
    log: Option<Arc<dyn DurabilityLog>>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    /// Start from the default configuration
    pub fn new(store: Arc<dyn RowStore>, bindings: Arc<dyn ConnectionBindings>) -> Self {
        Self {
            store,
            bindings,
            config: EngineConfig::default(),
            cache: None,
            locker: None,
            log: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `config`
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Load `rowcache.toml` from `dir`, writing the default file first if
    /// there is none
    pub fn config_dir(mut self, dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        EngineConfig::write_default_if_missing(&path)?;
        self.config = EngineConfig::from_file(&path)?;
        Ok(self)
    }

    /// Cache used by `cache` and `mixed` routing (default: a [`MemCache`]
    /// sharing the engine's CAS allocator and clock)
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Take a SQL-layer table lock alongside every write path
    pub fn table_locker(mut self, locker: Arc<dyn TableLocker>) -> Self {
        self.locker = Some(locker);
        self
    }

    /// Append committed mutations to `log`
    pub fn durability_log(mut self, log: Arc<dyn DurabilityLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Wall clock used for expiration
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resolve the mapping and start the engine
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the configuration is invalid, the mapping names
    ///   an unknown column or index, or `durability_log` is enabled without
    ///   a log attached
    /// - the row store's error if the mapped table cannot be described
    pub fn open(self) -> Result<CacheEngine> {
        let mut config = self.config;
        config.validate()?;
        if config.durability_log && self.log.is_none() {
            return Err(Error::config(
                "durability_log is enabled but no durability log is attached",
            ));
        }
        if self.log.is_some() {
            config.durability_log = true;
        }

        let def = self.store.describe_table(&config.table.table_name())?;
        let mapping = config.table.resolve(&def)?;

        let cas = Arc::new(CasAllocator::new());
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(MemCache::with_parts(Arc::clone(&cas), Arc::clone(&self.clock)))
        });

        let mut registry = Registry::new(self.store, self.bindings)
            .with_high_water(config.max_connections_before_cleanup);
        if let Some(locker) = self.locker {
            registry = registry.with_locker(locker);
        }
        let target = CursorTarget::new(mapping.table().clone(), mapping.index().clone());
        let lifecycle = LifecycleManager::new(registry, target, config.batch_policy());

        info!(
            target: "rowcache::engine",
            table = %mapping.table(),
            index = %config.table.index,
            routing = %config.routing,
            read_batch = config.effective_read_batch_size(),
            write_batch = config.effective_write_batch_size(),
            "Engine started"
        );

        let translator = Translator::new(lifecycle, mapping, cas, Arc::clone(&self.clock), self.log);
        Ok(CacheEngine {
            config,
            cache,
            translator,
            clock: self.clock,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Cache-protocol engine backed by a row store
///
/// Every operation names the connection it arrives on; at most one
/// operation per connection may be in flight.
pub struct CacheEngine {
    config: EngineConfig,
    cache: Arc<dyn CacheStore>,
    translator: Translator,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("routing", &self.config.routing)
            .field("translator", &self.translator)
            .finish()
    }
}

impl CacheEngine {
    /// Start building an engine over `store`
    pub fn builder(store: Arc<dyn RowStore>, bindings: Arc<dyn ConnectionBindings>) -> EngineBuilder {
        EngineBuilder::new(store, bindings)
    }

    /// Effective configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Routing applied to every operation
    pub fn routing(&self) -> Routing {
        self.config.routing
    }

    /// Resolved table mapping
    pub fn mapping(&self) -> &ResolvedMapping {
        self.translator.mapping()
    }

    /// Connection lifecycle manager
    pub fn lifecycle(&self) -> &LifecycleManager {
        self.translator.lifecycle()
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(self.routing(), self.cache.as_ref(), &self.translator)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Look up `key`
    pub fn get(&self, identity: ConnectionId, key: &[u8]) -> Result<CacheItem> {
        self.dispatcher().get(identity, key)
    }

    /// Apply a store verb and return the new CAS token
    ///
    /// `item.expiration` is in protocol form: 0 for never, up to 30 days
    /// relative, absolute unix seconds beyond that. `item.cas` is the
    /// client's token for [`StoreOp::Cas`].
    pub fn store(&self, identity: ConnectionId, mut item: CacheItem, op: StoreOp) -> Result<u64> {
        item.expiration = absolute_expiration(item.expiration, self.clock.now());
        self.dispatcher().store(identity, item, op)
    }

    /// Delete `key`; a non-zero `cas` must match
    pub fn delete(&self, identity: ConnectionId, key: &[u8], cas: u64) -> Result<()> {
        self.dispatcher().delete(identity, key, cas)
    }

    /// Increment or decrement `key`
    pub fn arithmetic(
        &self,
        identity: ConnectionId,
        key: &[u8],
        req: &ArithmeticRequest,
    ) -> Result<ArithmeticOutcome> {
        self.dispatcher().arithmetic(identity, key, req)
    }

    /// Remove every item
    pub fn flush(&self, identity: ConnectionId) -> Result<()> {
        info!(target: "rowcache::engine", %identity, routing = %self.routing(), "Flushing all items");
        self.dispatcher().flush(identity)
    }

    /// The protocol layer closed `identity`; release its state now if idle
    pub fn release_connection(&self, identity: ConnectionId) -> bool {
        self.lifecycle().release_connection(identity)
    }

    /// Commit and close every connection state
    ///
    /// Returns the number of states torn down. Safe to call more than once.
    pub fn shutdown(&self) -> usize {
        let removed = self.lifecycle().shutdown();
        info!(
            target: "rowcache::engine",
            removed,
            teardown_failures = self.lifecycle().registry().teardown_failures(),
            "Engine shut down"
        );
        removed
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        let removed = self.lifecycle().shutdown();
        if removed > 0 {
            debug!(target: "rowcache::engine", removed, "Released connection states on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcache_concurrency::CookieTable;
    use rowcache_core::{ColumnDef, TableDef, TableName};
    use rowcache_storage::{MemDurabilityLog, MemRowStore, MemTableLocker};
    use tempfile::TempDir;

    fn store() -> Arc<MemRowStore> {
        let store = Arc::new(MemRowStore::new());
        store
            .create_table(TableDef::new(
                TableName::new("test", "demo_test"),
                vec![
                    ColumnDef::bytes("c1"),
                    ColumnDef::bytes("c2"),
                    ColumnDef::uint("c3"),
                    ColumnDef::uint("c4"),
                    ColumnDef::uint("c5"),
                ],
                0,
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_open_with_defaults() {
        let engine = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .open()
            .unwrap();
        assert_eq!(engine.routing(), Routing::Store);
        assert_eq!(engine.lifecycle().policy().write_batch(), 32);
        assert!(!engine.mapping().uses_secondary_index());
    }

    #[test]
    fn test_unknown_column_fails_startup() {
        let mut config = EngineConfig::default();
        config.table.value_columns = vec!["nope".into()];
        let result = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .config(config)
            .open();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_table_fails_startup() {
        let mut config = EngineConfig::default();
        config.table.table = "missing".into();
        let result = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .config(config)
            .open();
        assert!(matches!(result, Err(Error::TableNotFound(_))));
    }

    #[test]
    fn test_durability_flag_needs_log() {
        let mut config = EngineConfig::default();
        config.durability_log = true;
        let result = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .config(config.clone())
            .open();
        assert!(matches!(result, Err(Error::Config(_))));

        let engine = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .config(config)
            .durability_log(Arc::new(MemDurabilityLog::new()))
            .open()
            .unwrap();
        assert_eq!(engine.lifecycle().policy().write_batch(), 1);
    }

    #[test]
    fn test_attached_log_enables_single_write_batches() {
        let engine = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .durability_log(Arc::new(MemDurabilityLog::new()))
            .open()
            .unwrap();
        assert!(engine.config().durability_log);
        assert_eq!(engine.config().effective_write_batch_size(), 1);
    }

    #[test]
    fn test_config_dir_writes_default_file() {
        let dir = TempDir::new().unwrap();
        let engine = CacheEngine::builder(store(), Arc::new(CookieTable::new()))
            .config_dir(dir.path())
            .unwrap()
            .open()
            .unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(engine.config(), &EngineConfig::default());
    }

    #[test]
    fn test_drop_releases_states_and_table_locks() {
        let store = store();
        let locker = Arc::new(MemTableLocker::new());
        {
            let engine = CacheEngine::builder(store.clone(), Arc::new(CookieTable::new()))
                .table_locker(locker.clone())
                .open()
                .unwrap();
            engine
                .store(ConnectionId::new(1), CacheItem::new("k", "v"), StoreOp::Set)
                .unwrap();
            assert_eq!(locker.held_locks(), 1);
        }
        assert_eq!(locker.held_locks(), 0);
        assert_eq!(locker.open_sessions(), 0);
        let stats = store.stats();
        assert_eq!(stats.cursors_open(), 0);
        assert_eq!(stats.txns_active(), 0);
        assert!(store.peek(&TableName::new("test", "demo_test"), b"k").is_some());
    }
}
