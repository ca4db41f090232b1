//! Batched commit policy
//!
//! Reads and writes are counted separately per connection. A path's
//! transaction commits once its counter reaches the batch size; cursors are
//! kept and reattached to the next transaction.

use rowcache_core::OpKind;

/// Read operations per read-transaction commit when not configured
pub const DEFAULT_READ_BATCH: u64 = 1024;

/// Write operations per write-transaction commit when not configured
pub const DEFAULT_WRITE_BATCH: u64 = 32;

/// Commit thresholds for the read and write paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    read_batch: u64,
    write_batch: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            read_batch: DEFAULT_READ_BATCH,
            write_batch: DEFAULT_WRITE_BATCH,
        }
    }
}

impl BatchPolicy {
    /// Build a policy; 0 selects the default size
    ///
    /// With a durability log every mutation must be visible to the log on
    /// its own, so the write batch is forced to 1.
    pub fn new(read_batch: u64, write_batch: u64, durability_log: bool) -> Self {
        let read_batch = if read_batch == 0 {
            DEFAULT_READ_BATCH
        } else {
            read_batch
        };
        let write_batch = match (durability_log, write_batch) {
            (true, _) => 1,
            (false, 0) => DEFAULT_WRITE_BATCH,
            (false, n) => n,
        };
        Self {
            read_batch,
            write_batch,
        }
    }

    /// Read ops per commit
    pub fn read_batch(&self) -> u64 {
        self.read_batch
    }

    /// Write/delete ops per commit
    pub fn write_batch(&self) -> u64 {
        self.write_batch
    }

    /// True when a path that has now completed `count` ops of `kind` since
    /// its last commit must commit
    pub fn should_commit(&self, kind: OpKind, count: u64) -> bool {
        match kind {
            OpKind::Read => count >= self.read_batch,
            OpKind::Write | OpKind::Delete => count >= self.write_batch,
            OpKind::Flush => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = BatchPolicy::new(0, 0, false);
        assert_eq!(policy, BatchPolicy::default());
        assert_eq!(policy.read_batch(), 1024);
        assert_eq!(policy.write_batch(), 32);
    }

    #[test]
    fn test_durability_log_forces_single_write() {
        assert_eq!(BatchPolicy::new(10, 0, true).write_batch(), 1);
        assert_eq!(BatchPolicy::new(10, 32, true).write_batch(), 1);
        assert_eq!(BatchPolicy::new(10, 500, true).write_batch(), 1);
        assert_eq!(BatchPolicy::new(10, 500, true).read_batch(), 10);
    }

    #[test]
    fn test_should_commit_thresholds() {
        let policy = BatchPolicy::new(3, 2, false);
        assert!(!policy.should_commit(OpKind::Read, 2));
        assert!(policy.should_commit(OpKind::Read, 3));
        assert!(!policy.should_commit(OpKind::Write, 1));
        assert!(policy.should_commit(OpKind::Delete, 2));
        assert!(policy.should_commit(OpKind::Flush, 0));
    }
}
