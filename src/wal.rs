//! Write-ahead log for the current MemTable generation.
//!
//! Every mutating operation is appended here *before* the MemTable is
//! touched. The log is truncated together with the MemTable flush; that pair
//! is atomic from the executor's perspective because no other command runs
//! in between. The log is in-memory: `flush` is a no-op sync point kept so a
//! durable variant has somewhere to hook in.

use crate::KvResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A logged mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Set {
        key: String,
        value: Bytes,
        ttl_ms: Option<u64>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl_ms: u64,
    },
}

impl Operation {
    /// The key this operation targets.
    pub fn key(&self) -> &str {
        match self {
            Operation::Set { key, .. } | Operation::Del { key } | Operation::Expire { key, .. } => {
                key
            }
        }
    }
}

/// One WAL entry: an operation plus its append sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub sequence: u64,
    pub op: Operation,
}

/// Append-only operation log for the current MemTable generation.
#[derive(Debug, Default)]
pub struct Wal {
    records: Vec<WalRecord>,
    next_sequence: u64,
}

impl Wal {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Append an operation, returning the sequence assigned to it.
    pub fn append(&mut self, op: Operation) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.records.push(WalRecord { sequence, op });
        sequence
    }

    /// Sync point. A no-op for the in-process log; a durable variant would
    /// flush bytes to stable storage here.
    pub fn flush(&self) -> KvResult<()> {
        tracing::trace!(records = self.records.len(), "wal flush");
        Ok(())
    }

    /// Drop all records. Called when the MemTable is flushed into an L0 run.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Remove the most recent record. Used to roll back an append whose
    /// MemTable mutation failed.
    pub fn truncate_last(&mut self) -> Option<WalRecord> {
        self.records.pop()
    }

    /// Iterate the pending records in append order.
    pub fn replay(&self) -> impl Iterator<Item = &WalRecord> {
        self.records.iter()
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log holds no pending records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
