//! Engine configuration via `rowcache.toml`
//!
//! On first start a default `rowcache.toml` is written next to the engine's
//! other files. To change settings, edit the file and restart.

use crate::routing::Routing;
use rowcache_concurrency::{BatchPolicy, DEFAULT_HIGH_WATER, DEFAULT_READ_BATCH, DEFAULT_WRITE_BATCH};
use rowcache_core::{Error, Result, TableMapping};
use rowcache_storage::{MemRowStore, DEFAULT_LOCK_WAIT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "rowcache.toml";

fn default_read_batch() -> u64 {
    DEFAULT_READ_BATCH
}

fn default_write_batch() -> u64 {
    DEFAULT_WRITE_BATCH
}

fn default_high_water() -> usize {
    DEFAULT_HIGH_WATER
}

fn default_lock_wait_ms() -> u64 {
    DEFAULT_LOCK_WAIT.as_millis() as u64
}

fn default_table() -> TableMapping {
    TableMapping {
        database: "test".to_string(),
        table: "demo_test".to_string(),
        key_column: "c1".to_string(),
        value_columns: vec!["c2".to_string()],
        flags_column: Some("c3".to_string()),
        cas_column: Some("c4".to_string()),
        expire_column: Some("c5".to_string()),
        index: "PRIMARY".to_string(),
        separator: "|".to_string(),
    }
}

/// Engine configuration loaded from `rowcache.toml`
///
/// # Example
///
/// ```toml
/// routing = "mixed"
/// read_batch_size = 1024
/// write_batch_size = 32
///
/// [table]
/// database = "test"
/// table = "demo_test"
/// key_column = "c1"
/// value_columns = ["c2"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where operations go: `"store"`, `"cache"` or `"mixed"`
    #[serde(default)]
    pub routing: Routing,
    /// Reads per read-transaction commit (0 = default)
    #[serde(default = "default_read_batch")]
    pub read_batch_size: u64,
    /// Mutations per write-transaction commit (0 = default)
    #[serde(default = "default_write_batch")]
    pub write_batch_size: u64,
    /// Append every mutation to the durability log; forces single-write batches
    #[serde(default)]
    pub durability_log: bool,
    /// Registry size above which stale connection states are reclaimed
    #[serde(default = "default_high_water")]
    pub max_connections_before_cleanup: usize,
    /// Table lock wait of the in-memory row store, in milliseconds
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_timeout_ms: u64,
    /// Column mapping of the backing table
    #[serde(default = "default_table")]
    pub table: TableMapping,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            routing: Routing::default(),
            read_batch_size: DEFAULT_READ_BATCH,
            write_batch_size: DEFAULT_WRITE_BATCH,
            durability_log: false,
            max_connections_before_cleanup: DEFAULT_HIGH_WATER,
            lock_wait_timeout_ms: default_lock_wait_ms(),
            table: default_table(),
        }
    }
}

impl EngineConfig {
    /// Commit policy derived from the batch settings
    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy::new(
            self.read_batch_size,
            self.write_batch_size,
            self.durability_log,
        )
    }

    /// Read batch size after applying the default for 0
    pub fn effective_read_batch_size(&self) -> u64 {
        self.batch_policy().read_batch()
    }

    /// Write batch size after applying the default for 0 and the
    /// durability-log override
    pub fn effective_write_batch_size(&self) -> u64 {
        self.batch_policy().write_batch()
    }

    /// Lock wait for the in-memory row store
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    /// Empty in-memory row store whose lock requests wait `lock_wait()`
    pub fn memory_row_store(&self) -> MemRowStore {
        MemRowStore::with_lock_wait(self.lock_wait())
    }

    /// Check settings that parse but cannot work
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty key column, no value columns, or
    /// an empty database or table name.
    pub fn validate(&self) -> Result<()> {
        let t = &self.table;
        if t.database.is_empty() || t.table.is_empty() {
            return Err(Error::config("[table] needs both database and table"));
        }
        if t.key_column.is_empty() {
            return Err(Error::config("[table] key_column must not be empty"));
        }
        if t.value_columns.is_empty() {
            return Err(Error::config("[table] value_columns must name at least one column"));
        }
        Ok(())
    }

    /// Returns the default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# rowcache configuration
#
# Routing: "store" (default), "cache" or "mixed"
#   "store" = every operation goes to the row store
#   "cache" = every operation goes to the in-memory cache
#   "mixed" = reads try the cache first, writes go to both
routing = "store"

# Operations per transaction commit. 0 selects the default.
read_batch_size = 1024
write_batch_size = 32

# Append every mutation to the durability log.
# When enabled every write commits on its own (write_batch_size = 1).
durability_log = false

# Stale connection states are reclaimed once the registry grows past this.
max_connections_before_cleanup = 2048

# Table lock wait of the in-memory row store, in milliseconds.
lock_wait_timeout_ms = 50

[table]
database = "test"
table = "demo_test"
key_column = "c1"
value_columns = ["c2"]
flags_column = "c3"
cas_column = "c4"
expire_column = "c5"
# "PRIMARY" or the name of a unique secondary index on key_column
index = "PRIMARY"
# Joins multiple value columns on read, splits them on write
separator = "|"
"#
    }

    /// Read and parse config from a file path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.routing, Routing::Store);
        assert_eq!(config.effective_read_batch_size(), 1024);
        assert_eq!(config.effective_write_batch_size(), 32);
        assert_eq!(config.max_connections_before_cleanup, 2048);
        assert_eq!(config.lock_wait(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_toml_matches_default() {
        let config: EngineConfig = toml::from_str(EngineConfig::default_toml()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn parse_routing_modes() {
        for (text, routing) in [
            ("store", Routing::Store),
            ("cache", Routing::Cache),
            ("mixed", Routing::Mixed),
        ] {
            let config: EngineConfig =
                toml::from_str(&format!("routing = \"{}\"", text)).unwrap();
            assert_eq!(config.routing, routing);
        }
        assert!(toml::from_str::<EngineConfig>("routing = \"disk\"").is_err());
    }

    #[test]
    fn memory_row_store_uses_configured_lock_wait() {
        use rowcache_core::{ColumnDef, IndexSpec, IsolationLevel, LockMode, RowStore, TableDef};
        use std::time::Instant;

        let config: EngineConfig = toml::from_str("lock_wait_timeout_ms = 5").unwrap();
        let store = config.memory_row_store();
        let table = config.table.table_name();
        store
            .create_table(TableDef::new(table.clone(), vec![ColumnDef::bytes("c1")], 0))
            .unwrap();
        let holder = store.begin_transaction(IsolationLevel::ReadUncommitted).unwrap();
        store
            .open_cursor(&table, &IndexSpec::Primary, holder, LockMode::Exclusive)
            .unwrap();

        let waiter = store.begin_transaction(IsolationLevel::ReadUncommitted).unwrap();
        let started = Instant::now();
        let result = store.open_cursor(&table, &IndexSpec::Primary, waiter, LockMode::IntentShared);
        assert!(matches!(result, Err(Error::LockTimeout { .. })));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(5));
        assert!(waited < DEFAULT_LOCK_WAIT * 20);
    }

    #[test]
    fn zero_batch_means_default() {
        let config: EngineConfig =
            toml::from_str("read_batch_size = 0\nwrite_batch_size = 0").unwrap();
        assert_eq!(config.effective_read_batch_size(), 1024);
        assert_eq!(config.effective_write_batch_size(), 32);
    }

    #[test]
    fn durability_log_forces_write_batch_one() {
        let config: EngineConfig =
            toml::from_str("write_batch_size = 500\ndurability_log = true").unwrap();
        assert_eq!(config.write_batch_size, 500);
        assert_eq!(config.effective_write_batch_size(), 1);
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(!path.exists());

        EngineConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(EngineConfig::from_file(&path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "routing = \"mixed\"\n").unwrap();

        EngineConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap().routing, Routing::Mixed);
    }

    #[test]
    fn round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = EngineConfig::default();
        config.routing = Routing::Cache;
        config.table.value_columns = vec!["c2".into(), "c6".into()];
        config.table.cas_column = None;
        config.table.index = "by_key".into();

        config.write_to_file(&path).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn invalid_mapping_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[table]\ndatabase = \"test\"\ntable = \"t\"\nkey_column = \"k\"\nvalue_columns = []\n",
        )
        .unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(Error::Config(_))
        ));
    }
}
