//! Connection binding table ("cookie" slots)
//!
//! The protocol layer owns one engine-specific slot per connection. The
//! engine writes the id of the connection's state into it; the protocol
//! layer clears it when the connection closes. `CookieTable` is the
//! in-process stand-in for that slot array.

use dashmap::DashMap;
use rowcache_core::{ConnectionBindings, ConnectionId, StateId};

/// `DashMap`-backed [`ConnectionBindings`]
#[derive(Debug, Default)]
pub struct CookieTable {
    slots: DashMap<ConnectionId, StateId>,
}

impl CookieTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The protocol layer closed `conn`: its slot is cleared
    ///
    /// The state it pointed at becomes stale and is reclaimed by the next
    /// cleanup pass.
    pub fn close(&self, conn: ConnectionId) {
        self.slots.remove(&conn);
    }

    /// Number of bound connections
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no connection is bound
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl ConnectionBindings for CookieTable {
    fn binding(&self, conn: ConnectionId) -> Option<StateId> {
        self.slots.get(&conn).map(|slot| *slot)
    }

    fn bind(&self, conn: ConnectionId, state: Option<StateId>) {
        match state {
            Some(id) => {
                self.slots.insert(conn, id);
            }
            None => {
                self.slots.remove(&conn);
            }
        }
    }
}
