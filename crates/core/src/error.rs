//! Error types for rowcache
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every error maps onto a protocol-level [`Status`] through [`Error::status`],
//! so the protocol layer never has to inspect variants itself.

use crate::types::{ConnectionId, CursorHandle, TxnHandle};
use std::io;
use thiserror::Error;

/// Result type alias for rowcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the rowcache engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (config files, etc.)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Configuration or schema mapping error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key not found (or found but expired)
    #[error("Key not found")]
    NotFound,

    /// CAS token did not match the stored item
    #[error("Item exists with a different CAS token")]
    Exists,

    /// Conditional store (add/replace/append/prepend) was not applied
    #[error("Item not stored")]
    NotStored,

    /// Arithmetic on a value that is not an unsigned decimal
    #[error("Cannot increment or decrement non-numeric value")]
    NonNumeric,

    /// Allocation of engine state failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// A second operation was issued on a connection whose state is in use
    #[error("Connection {0} already has an operation in flight")]
    ConnectionBusy(ConnectionId),

    /// Table lock could not be granted in time
    #[error("Lock wait timeout on table {table}")]
    LockTimeout {
        /// Table whose lock was requested
        table: String,
    },

    /// Insert collided with an existing row
    #[error("Duplicate key")]
    DuplicateKey,

    /// Cursor used while not attached to an active transaction
    #[error("Cursor {0} is not attached to an active transaction")]
    CursorDetached(CursorHandle),

    /// Transaction handle is unknown or already finished
    #[error("Transaction {0} is not active")]
    TransactionNotActive(TxnHandle),

    /// Cursor handle is unknown (never opened or already closed)
    #[error("Unknown cursor {0}")]
    UnknownCursor(CursorHandle),

    /// Table does not exist in the row store
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table truncate failed; the exclusive lock has already been released
    #[error("Truncate of {table} failed: {source}")]
    TruncateFailed {
        /// Table that was being truncated
        table: String,
        /// Underlying row-store error
        #[source]
        source: Box<Error>,
    },

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Row-store layer error not covered above
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl Error {
    /// Build a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Build a generic storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::StorageError(msg.into())
    }

    /// Protocol status code for this error
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound => Status::NotFound,
            Error::Exists => Status::Exists,
            Error::NotStored => Status::NotStored,
            Error::NonNumeric => Status::InvalidArgument,
            Error::OutOfMemory(_) => Status::OutOfMemory,
            _ => Status::Failed,
        }
    }

    /// True for the "normal" negative outcomes of cache semantics
    /// (miss, CAS mismatch, conditional store refused)
    pub fn is_semantic_miss(&self) -> bool {
        matches!(self, Error::NotFound | Error::Exists | Error::NotStored)
    }
}

/// Protocol-level result code returned to the cache protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation succeeded
    Success,
    /// Key missing or expired
    NotFound,
    /// CAS mismatch
    Exists,
    /// Conditional store refused
    NotStored,
    /// Bad argument (non-numeric arithmetic)
    InvalidArgument,
    /// Could not allocate
    OutOfMemory,
    /// Any other failure
    Failed,
}

impl Status {
    /// Status of a whole result
    pub fn of<T>(result: &Result<T>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}
