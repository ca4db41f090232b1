//! Operation routing
//!
//! One [`Routing`] value is chosen per operation and consumed by the
//! [`Dispatcher`], the only place that decides which backend sees what:
//!
//! | Verb       | `Cache`      | `Store`     | `Mixed`                                  |
//! |------------|--------------|-------------|------------------------------------------|
//! | get        | cache        | row store   | cache, row store on miss                 |
//! | store      | cache        | row store   | cache, then row store (row store result) |
//! | delete     | cache        | row store   | evict from cache, then row store         |
//! | arithmetic | cache        | row store   | cache, then row store (row store result) |
//! | flush      | cache        | table flush | cache flush, then table flush            |

use crate::translator::Translator;
use rowcache_core::{
    ArithmeticOutcome, ArithmeticRequest, CacheItem, CacheStore, ConnectionId, Error, Result,
    StoreOp,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Backend(s) an operation is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Routing {
    /// Row store only
    #[default]
    Store,
    /// In-memory cache only
    Cache,
    /// Cache in front of the row store
    Mixed,
}

impl Routing {
    /// True if the cache takes part
    pub fn uses_cache(&self) -> bool {
        matches!(self, Routing::Cache | Routing::Mixed)
    }

    /// True if the row store takes part
    pub fn uses_store(&self) -> bool {
        matches!(self, Routing::Store | Routing::Mixed)
    }

    /// Config spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Routing::Store => "store",
            Routing::Cache => "cache",
            Routing::Mixed => "mixed",
        }
    }
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends one operation to the backends its [`Routing`] names
pub struct Dispatcher<'a> {
    routing: Routing,
    cache: &'a dyn CacheStore,
    store: &'a Translator,
}

impl<'a> Dispatcher<'a> {
    /// Bind a routing decision to the backends
    pub fn new(routing: Routing, cache: &'a dyn CacheStore, store: &'a Translator) -> Self {
        Self {
            routing,
            cache,
            store,
        }
    }

    /// Routing in effect
    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// Look up `key`
    pub fn get(&self, identity: ConnectionId, key: &[u8]) -> Result<CacheItem> {
        match self.routing {
            Routing::Cache => self.cache.get(key).ok_or(Error::NotFound),
            Routing::Store => self.store.get(identity, key),
            Routing::Mixed => match self.cache.get(key) {
                Some(item) => Ok(item),
                None => self.store.get(identity, key),
            },
        }
    }

    /// Apply a store verb; returns the new CAS token
    pub fn store(&self, identity: ConnectionId, item: CacheItem, op: StoreOp) -> Result<u64> {
        match self.routing {
            Routing::Cache => self.cache.store(item, op),
            Routing::Store => self.store.store(identity, item, op),
            Routing::Mixed => {
                if let Err(e) = self.cache.store(item.clone(), op) {
                    trace!(target: "rowcache::engine", op = op.as_str(), error = %e, "Cache side of mixed store refused");
                }
                self.store.store(identity, item, op)
            }
        }
    }

    /// Delete `key`, checking `cas` when non-zero
    pub fn delete(&self, identity: ConnectionId, key: &[u8], cas: u64) -> Result<()> {
        match self.routing {
            Routing::Cache => self.cache.delete(key, cas),
            Routing::Store => self.store.delete(identity, key, cas),
            Routing::Mixed => {
                self.cache.evict(key);
                self.store.delete(identity, key, cas)
            }
        }
    }

    /// Increment or decrement `key`
    pub fn arithmetic(
        &self,
        identity: ConnectionId,
        key: &[u8],
        req: &ArithmeticRequest,
    ) -> Result<ArithmeticOutcome> {
        match self.routing {
            Routing::Cache => self.cache.arithmetic(key, req),
            Routing::Store => self.store.arithmetic(identity, key, req),
            Routing::Mixed => {
                if let Err(e) = self.cache.arithmetic(key, req) {
                    trace!(target: "rowcache::engine", error = %e, "Cache side of mixed arithmetic refused");
                }
                self.store.arithmetic(identity, key, req)
            }
        }
    }

    /// Remove everything
    pub fn flush(&self, identity: ConnectionId) -> Result<()> {
        match self.routing {
            Routing::Cache => {
                self.cache.flush();
                Ok(())
            }
            Routing::Store => self.store.flush(identity),
            Routing::Mixed => {
                self.cache.flush();
                self.store.flush(identity)
            }
        }
    }
}
