//! An embeddable, in-process key-value store built on an LSM tree.
//!
//! Writes land in a write-ahead log and a mutable in-memory buffer (the
//! MemTable); when the buffer passes its byte threshold it is frozen into an
//! immutable sorted run at level 0, and a background compactor merges runs
//! down the levels, resolving shadowing and dropping tombstoned and expired
//! entries. The public surface is Redis-flavored: point get/set/delete,
//! existence and expiry, counters, batched reads/writes, pattern
//! enumeration, and statistics.
//!
//! # Architecture
//!
//! ```text
//! Commands → Executor (owned actor) → WAL → MemTable → L0 runs → L1..L6 runs
//! ```
//!
//! All engine state is owned by a single executor task consuming an ordered
//! request channel, so commands run serially and reads see a consistent
//! point-in-time view without locks on the hot path.
//!
//! # Usage
//!
//! ```rust,no_run
//! use lsm_kv::{Executor, KvConfig};
//!
//! # async fn example() -> Result<(), lsm_kv::KvError> {
//! let (store, _task) = Executor::spawn(KvConfig::default())?;
//!
//! store.set("greeting", "hello", None).await?;
//! let val = store.get("greeting").await?;
//! assert_eq!(val.as_deref(), Some(b"hello".as_slice()));
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod clock;
pub mod command;
pub mod compaction;
pub mod config;
pub mod events;
pub mod memtable;
pub mod pattern;
pub mod sstable;
pub mod store;
pub mod wal;

pub use command::{Command, Executor, Output, StoreHandle};
pub use config::KvConfig;
pub use events::Event;
pub use store::{KvStore, StoreInfo};

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Each variant maps to one wire-level error code (see [`KvError::code`]);
/// the dispatcher in front of the engine forwards `(code, message)` pairs to
/// clients verbatim.
#[derive(Error, Debug, Clone)]
pub enum KvError {
    /// Malformed command arguments. Safe to retry with corrected input; a
    /// validation failure never mutates the MemTable or the WAL.
    #[error("validation error: {0}")]
    Validation(String),

    /// An internal invariant violation or resource fault.
    #[error("storage error: {0}")]
    Storage(String),

    /// A caller-side deadline elapsed before the response arrived. The
    /// engine never generates this itself; it still completes the command.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A value's stringification or serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Residual category.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl KvError {
    /// The wire-level error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            KvError::Validation(_) => "VALIDATION_ERROR",
            KvError::Storage(_) => "STORAGE_ERROR",
            KvError::Timeout(_) => "TIMEOUT",
            KvError::Serialization(_) => "SERIALIZATION_ERROR",
            KvError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Result type alias for engine operations.
pub type KvResult<T> = Result<T, KvError>;
