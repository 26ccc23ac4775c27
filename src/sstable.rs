//! Immutable sorted runs (SSTables).
//!
//! A run is a snapshot frozen at construction: a key-sorted sequence of
//! versioned entries (tombstones included) plus metadata and an optional
//! bloom filter over the keys. Runs are immutable from creation until a
//! compaction step consumes them.

use crate::bloom::BloomFilter;
use crate::memtable::Entry;
use crate::{KvError, KvResult};
use serde::{Deserialize, Serialize};

/// Metadata describing a run; also the per-run shape reported by INFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsTableMeta {
    pub id: u64,
    pub level: u32,
    pub min_key: String,
    pub max_key: String,
    pub size_bytes: u64,
    pub entry_count: u64,
    pub created_at: u64,
}

/// An immutable, key-sorted run of entries.
#[derive(Debug, Clone)]
pub struct SsTable {
    meta: SsTableMeta,
    entries: Vec<Entry>,
    bloom: Option<BloomFilter>,
}

impl SsTable {
    /// Freeze a sorted sequence of entries into a run at the given level.
    ///
    /// Keys must be unique and strictly ascending; an empty or unsorted
    /// input is an invariant violation.
    pub fn build(
        id: u64,
        level: u32,
        entries: Vec<Entry>,
        enable_bloom: bool,
        created_at: u64,
    ) -> KvResult<Self> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Err(KvError::Storage("cannot build an empty run".to_string()));
        };
        if entries.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(KvError::Storage(format!(
                "run {id} input is not strictly key-sorted"
            )));
        }

        let bloom = enable_bloom.then(|| {
            let mut filter = BloomFilter::with_capacity(entries.len());
            for entry in &entries {
                filter.insert(&entry.key);
            }
            filter
        });

        let meta = SsTableMeta {
            id,
            level,
            min_key: first.key.clone(),
            max_key: last.key.clone(),
            size_bytes: entries.iter().map(|e| e.cost() as u64).sum(),
            entry_count: entries.len() as u64,
            created_at,
        };

        Ok(Self {
            meta,
            entries,
            bloom,
        })
    }

    /// Probabilistic membership hint: `false` is authoritative, `true`
    /// means the run may contain the key. Combines the key-range check with
    /// the bloom filter when one was built.
    pub fn may_contain(&self, key: &str) -> bool {
        if key < self.meta.min_key.as_str() || key > self.meta.max_key.as_str() {
            return false;
        }
        match &self.bloom {
            Some(filter) => filter.may_contain(key),
            None => true,
        }
    }

    /// Binary-search the run for a key, returning the raw entry.
    ///
    /// Tombstones and expired entries are returned as-is: the caller's merge
    /// logic decides what the entry's state means for the read.
    pub fn lookup(&self, key: &str) -> Option<&Entry> {
        self.entries
            .binary_search_by(|e| e.key.as_str().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// All entries in ascending key order, tombstones included.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Whether the key ranges of two runs intersect.
    pub fn overlaps(&self, other: &SsTable) -> bool {
        self.meta.min_key <= other.meta.max_key && other.meta.min_key <= self.meta.max_key
    }

    /// Whether this run's key range intersects `[min_key, max_key]`.
    pub fn overlaps_range(&self, min_key: &str, max_key: &str) -> bool {
        self.meta.min_key.as_str() <= max_key && min_key <= self.meta.max_key.as_str()
    }

    /// Estimated false-positive rate of the bloom filter, if one was built.
    pub fn bloom_fp_rate(&self) -> Option<f64> {
        self.bloom.as_ref().map(|f| f.estimated_fp_rate())
    }

    pub fn meta(&self) -> &SsTableMeta {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn level(&self) -> u32 {
        self.meta.level
    }

    pub fn min_key(&self) -> &str {
        &self.meta.min_key
    }

    pub fn max_key(&self) -> &str {
        &self.meta.max_key
    }

    pub fn size_bytes(&self) -> u64 {
        self.meta.size_bytes
    }

    pub fn entry_count(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn created_at(&self) -> u64 {
        self.meta.created_at
    }
}
