//! Engine lifecycle events.
//!
//! The engine publishes events to registered observers over a broadcast
//! channel. Observers receive owned copies of the payloads; they never hold
//! references into mutable engine state. An event is published only after
//! the mutation it describes is committed to the WAL and the MemTable, so
//! an observer can never see an event for a write that a subsequent read
//! would miss.

use crate::compaction::CompactionStats;
use bytes::Bytes;

/// An event published to observers.
#[derive(Debug, Clone)]
pub enum Event {
    Set {
        key: String,
        value: Bytes,
        ttl_ms: Option<u64>,
    },
    Get {
        key: String,
    },
    Del {
        key: String,
        deleted: bool,
    },
    Expire {
        key: String,
        ttl_ms: u64,
    },
    Flush {
        runs_after_l0: usize,
    },
    CompactionStart {
        level: u32,
    },
    CompactionEnd {
        level: u32,
        stats: CompactionStats,
    },
    Error {
        code: &'static str,
        message: String,
    },
}
