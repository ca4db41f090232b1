//! Core types and traits for rowcache
//!
//! This crate defines the foundational types used throughout the system:
//! - ConnectionId / StateId: connection identity and per-connection state identity
//! - TxnHandle / CursorHandle: opaque row-store handles
//! - LockMode / IsolationLevel / OpKind / AccessIntent: transaction parameters
//! - Row / Column / TableDef: the row model
//! - CacheItem / StoreOp: cache item semantics shared by all backends
//! - TableMapping: column-to-field schema mapping
//! - Error / Status: error hierarchy and protocol result codes
//! - Traits: RowStore, CacheStore, ConnectionBindings, TableLocker, DurabilityLog, Clock

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod item;
pub mod mapping;
pub mod row;
pub mod traits;
pub mod types;

pub use error::{Error, Result, Status};
pub use item::{
    absolute_expiration, apply_arithmetic, apply_store, check_delete, live, ArithmeticOutcome,
    ArithmeticRequest, CacheItem, CasAllocator, StoreOp, REALTIME_MAXDELTA,
};
pub use mapping::{ResolvedMapping, TableMapping};
pub use row::{Column, ColumnDef, ColumnKind, IndexSpec, Row, SecondaryIndexDef, TableDef, TableName};
pub use traits::{
    CacheStore, Clock, ConnectionBindings, DurabilityLog, ExternalTable, LogOp, LogRecord,
    RowStore, SessionId, SystemClock, TableLocker,
};
pub use types::{
    AccessIntent, ConnectionId, CursorHandle, IsolationLevel, LockMode, OpKind, StateId, TxnHandle,
};
