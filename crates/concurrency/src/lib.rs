//! Connection lifecycle layer for rowcache
//!
//! This crate maps protocol connections onto reusable row-store handles:
//! - CookieTable: per-connection binding slots
//! - ConnectionState / ConnectionLease: per-connection handles and the
//!   exclusive claim on them
//! - Registry / RegistryGuard: process-wide state registry and the proof
//!   that its lock is held
//! - LifecycleManager: acquire, batched commit, table flush, shutdown
//! - BatchPolicy: read/write commit thresholds

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod bindings;
pub mod lifecycle;
pub mod registry;
pub mod state;

pub use batch::{BatchPolicy, DEFAULT_READ_BATCH, DEFAULT_WRITE_BATCH};
pub use bindings::CookieTable;
pub use lifecycle::{CursorTarget, LifecycleManager, PathBuilder, PathKind};
pub use registry::{Registry, RegistryGuard, DEFAULT_HIGH_WATER};
pub use state::{ConnectionLease, ConnectionState, CursorSet, Handles};
