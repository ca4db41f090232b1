//! Cache engine for rowcache
//!
//! This crate sits between the protocol layer and the lower crates:
//! - CacheEngine: startup, the cache verbs, shutdown
//! - Routing: store / cache / mixed dispatch
//! - Translator: cache verbs as cursor operations under the lifecycle manager
//! - EngineConfig: `rowcache.toml`
//!
//! The engine is the only component that knows about:
//! - Which backend an operation goes to
//! - How cache items map onto table rows
//! - The durability log

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod routing;
pub mod translator;

pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use engine::{CacheEngine, EngineBuilder};
pub use routing::{Dispatcher, Routing};
pub use translator::Translator;
