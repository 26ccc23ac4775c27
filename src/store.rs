//! The engine facade: one MemTable, a leveled set of immutable runs, a WAL,
//! a compactor, and a clock.
//!
//! All mutating operations are serialized by the executor that owns the
//! store, so methods take `&mut self` and never lock. Writes go WAL-first,
//! then MemTable; when the MemTable passes its byte threshold it is frozen
//! into a new L0 run and the WAL is truncated. Reads consult the MemTable,
//! then L0 newest to oldest, then each deeper level; the first raw
//! occurrence of a key decides the result, so tombstones and expired
//! entries shadow older versions in deeper runs.

use crate::clock::{Clock, SystemClock};
use crate::compaction::{CompactionStats, Compactor, L0_RUN_THRESHOLD, MAX_LEVEL};
use crate::config::KvConfig;
use crate::events::Event;
use crate::memtable::{remaining_seconds, Entry, MemTable, RawLookup};
use crate::pattern::KeyPattern;
use crate::sstable::{SsTable, SsTableMeta};
use crate::wal::{Operation, Wal};
use crate::{KvError, KvResult};
use bytes::Bytes;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Result of the merged read path.
enum Lookup {
    /// The newest occurrence is a live value.
    Live {
        value: Bytes,
        expires_at: Option<u64>,
    },
    /// The newest occurrence is a tombstone or has expired; older versions
    /// in deeper runs stay hidden.
    Shadowed,
    /// No run contains the key at all.
    Absent,
}

/// The storage engine.
pub struct KvStore {
    config: KvConfig,
    clock: Arc<dyn Clock>,
    memtable: MemTable,
    /// Runs per level: L0 ordered by creation (oldest first), L1+ sorted by
    /// `min_key` and pairwise disjoint.
    levels: Vec<Vec<SsTable>>,
    wal: Wal,
    compactor: Compactor,
    compaction_history: Vec<CompactionStats>,
    events: broadcast::Sender<Event>,
    next_run_id: u64,
}

impl KvStore {
    /// Open an empty store on the system clock.
    pub fn open(config: KvConfig) -> KvResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open an empty store with an injected clock.
    pub fn open_with_clock(config: KvConfig, clock: Arc<dyn Clock>) -> KvResult<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let compactor = Compactor::new(L0_RUN_THRESHOLD, config.enable_bloom_filter);
        tracing::info!(
            memtable_mb = config.max_memtable_size_mb,
            bloom = config.enable_bloom_filter,
            "opened kv store"
        );
        Ok(Self {
            config,
            clock,
            memtable: MemTable::new(),
            levels: vec![Vec::new(); MAX_LEVEL + 1],
            wal: Wal::new(),
            compactor,
            compaction_history: Vec::new(),
            events,
            next_run_id: 1,
        })
    }

    /// Reconstruct a store from an externally provided WAL seed: the pending
    /// records are replayed into the MemTable in append order, and the seed
    /// becomes the store's log for the current generation.
    pub fn open_with_wal(config: KvConfig, wal: Wal, clock: Arc<dyn Clock>) -> KvResult<Self> {
        let mut store = Self::open_with_clock(config, clock)?;
        let now = store.clock.now_millis();
        let ops: Vec<Operation> = wal.replay().map(|r| r.op.clone()).collect();
        let replayed = ops.len();
        for op in ops {
            match op {
                Operation::Set { key, value, ttl_ms } => {
                    store.memtable.put(key, value, ttl_ms, now)?;
                }
                Operation::Del { key } => {
                    store.memtable.delete(&key, now)?;
                }
                Operation::Expire { key, ttl_ms } => {
                    store.memtable.expire(&key, ttl_ms, now);
                }
            }
        }
        store.wal = wal;
        tracing::info!(records = replayed, "replayed wal seed");
        Ok(store)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<Event> {
        self.events.clone()
    }

    /// Create or overwrite a key.
    pub fn set(&mut self, key: String, value: Bytes, ttl_ms: Option<u64>) -> KvResult<()> {
        Self::validate_key(&key)?;
        Self::validate_ttl(ttl_ms)?;
        let now = self.clock.now_millis();
        self.wal.append(Operation::Set {
            key: key.clone(),
            value: value.clone(),
            ttl_ms,
        });
        if let Err(e) = self.memtable.put(key.clone(), value.clone(), ttl_ms, now) {
            self.rollback_write(&e);
            return Err(e);
        }
        self.publish(Event::Set { key, value, ttl_ms });
        self.maybe_flush()
    }

    /// Point read. Expired and tombstoned entries read as absent.
    pub fn get(&mut self, key: &str) -> KvResult<Option<Bytes>> {
        Self::validate_key(key)?;
        let now = self.clock.now_millis();
        let result = match self.lookup_value(key, now) {
            Lookup::Live { value, .. } => Some(value),
            _ => None,
        };
        self.publish(Event::Get {
            key: key.to_string(),
        });
        Ok(result)
    }

    /// Delete a key. Writes a tombstone regardless; returns whether a live
    /// entry existed anywhere in the store.
    pub fn del(&mut self, key: &str) -> KvResult<bool> {
        Self::validate_key(key)?;
        let now = self.clock.now_millis();
        let deleted = matches!(self.lookup_value(key, now), Lookup::Live { .. });
        self.wal.append(Operation::Del {
            key: key.to_string(),
        });
        if let Err(e) = self.memtable.delete(key, now) {
            self.rollback_write(&e);
            return Err(e);
        }
        self.publish(Event::Del {
            key: key.to_string(),
            deleted,
        });
        self.maybe_flush()?;
        Ok(deleted)
    }

    /// Whether a live entry exists for the key.
    pub fn exists(&mut self, key: &str) -> KvResult<bool> {
        Self::validate_key(key)?;
        let now = self.clock.now_millis();
        Ok(matches!(self.lookup_value(key, now), Lookup::Live { .. }))
    }

    /// Update the expiry of a live entry. Returns false when the key is
    /// absent (or shadowed).
    pub fn expire(&mut self, key: &str, ttl_ms: u64) -> KvResult<bool> {
        Self::validate_key(key)?;
        Self::validate_ttl(Some(ttl_ms))?;
        let now = self.clock.now_millis();
        let Lookup::Live { value, .. } = self.lookup_value(key, now) else {
            return Ok(false);
        };
        self.wal.append(Operation::Expire {
            key: key.to_string(),
            ttl_ms,
        });
        if !self.memtable.expire(key, ttl_ms, now) {
            // The live entry resides in a run; rewrite it into the MemTable
            // with the new deadline.
            if let Err(e) =
                self.memtable
                    .put_with_deadline(key.to_string(), value, Some(now + ttl_ms), now)
            {
                self.rollback_write(&e);
                return Err(e);
            }
        }
        self.publish(Event::Expire {
            key: key.to_string(),
            ttl_ms,
        });
        self.maybe_flush()?;
        Ok(true)
    }

    /// Remaining TTL in whole seconds (ceiling): `-2` when absent, `-1` when
    /// present without expiry.
    pub fn ttl(&mut self, key: &str) -> KvResult<i64> {
        Self::validate_key(key)?;
        let now = self.clock.now_millis();
        Ok(match self.lookup_value(key, now) {
            Lookup::Live {
                expires_at: Some(at),
                ..
            } => remaining_seconds(at, now),
            Lookup::Live {
                expires_at: None, ..
            } => -1,
            _ => -2,
        })
    }

    /// Increment the key's integer value by one.
    pub fn incr(&mut self, key: &str) -> KvResult<i64> {
        self.add_delta(key, 1)
    }

    /// Decrement the key's integer value by one.
    pub fn decr(&mut self, key: &str) -> KvResult<i64> {
        self.add_delta(key, -1)
    }

    /// Live keys matching the glob pattern (all live keys when absent),
    /// deduplicated across the MemTable and every run.
    pub fn keys(&self, pattern: Option<&str>) -> KvResult<Vec<String>> {
        let matcher = match pattern {
            Some(p) => KeyPattern::compile(p)?,
            None => KeyPattern::match_all(),
        };
        let now = self.clock.now_millis();
        let mut out = Vec::new();
        self.visit_newest_entries(|entry| {
            if entry.is_live(now) && matcher.matches(&entry.key) {
                out.push(entry.key.clone());
            }
        });
        Ok(out)
    }

    /// Per-element GET, order preserved.
    pub fn mget(&mut self, keys: &[String]) -> KvResult<Vec<Option<Bytes>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Sequential per-element SET. Elements are validated up front so a
    /// malformed element cannot leave a partial batch behind.
    pub fn mset(&mut self, entries: Vec<(String, Bytes, Option<u64>)>) -> KvResult<()> {
        for (key, _, ttl_ms) in &entries {
            Self::validate_key(key)?;
            Self::validate_ttl(*ttl_ms)?;
        }
        for (key, value, ttl_ms) in entries {
            self.set(key, value, ttl_ms)?;
        }
        Ok(())
    }

    /// Clear the MemTable, every run, the WAL, and compaction statistics.
    pub fn flushall(&mut self) {
        self.memtable.clear();
        self.levels = vec![Vec::new(); MAX_LEVEL + 1];
        self.wal.clear();
        self.compaction_history.clear();
        tracing::info!("cleared all engine state");
    }

    /// Engine statistics in the canonical INFO shape.
    pub fn info(&self) -> StoreInfo {
        let now = self.clock.now_millis();
        let (oldest_created_at, newest_created_at) = self.memtable.created_at_range();
        let runs: Vec<SsTableMeta> = self
            .levels
            .iter()
            .flatten()
            .map(|run| run.meta().clone())
            .collect();
        let total_size_bytes =
            self.memtable.size_bytes() as u64 + runs.iter().map(|m| m.size_bytes).sum::<u64>();
        let mut total_entries = 0u64;
        self.visit_newest_entries(|entry| {
            if entry.is_live(now) {
                total_entries += 1;
            }
        });
        StoreInfo {
            memtable: MemtableInfo {
                size_bytes: self.memtable.size_bytes() as u64,
                entry_count: self.memtable.entry_count() as u64,
                oldest_created_at,
                newest_created_at,
            },
            runs,
            total_size_bytes,
            total_entries,
            compaction_history: self.compaction_history.clone(),
        }
    }

    /// Freeze the MemTable into a new L0 run and truncate the WAL. A no-op
    /// when the MemTable is empty.
    pub fn flush(&mut self) -> KvResult<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_millis();
        self.wal.flush()?;
        let entries = self.memtable.take_sorted(now);
        if !entries.is_empty() {
            let id = self.next_run_id;
            self.next_run_id += 1;
            let run = SsTable::build(id, 0, entries, self.config.enable_bloom_filter, now)?;
            tracing::info!(
                run = id,
                entries = run.entry_count(),
                bytes = run.size_bytes(),
                "flushed memtable to L0"
            );
            self.levels[0].push(run);
        }
        self.wal.clear();
        self.publish(Event::Flush {
            runs_after_l0: self.levels[0].len(),
        });
        Ok(())
    }

    /// Whether any level is over its run budget.
    pub fn compaction_pending(&self) -> bool {
        !self.compactor.in_progress() && self.compactor.needs_compaction(&self.levels).is_some()
    }

    /// Run at most one level's merge step. Returns whether a step ran.
    pub fn run_compaction_step(&mut self) -> KvResult<bool> {
        if self.compactor.in_progress() {
            return Ok(false);
        }
        let Some(level) = self.compactor.needs_compaction(&self.levels) else {
            return Ok(false);
        };
        self.publish(Event::CompactionStart {
            level: level as u32,
        });
        let now = self.clock.now_millis();
        match self
            .compactor
            .compact_step(&mut self.levels, level, now, &mut self.next_run_id)
        {
            Ok(stats) => {
                self.compaction_history.push(stats.clone());
                self.publish(Event::CompactionEnd {
                    level: level as u32,
                    stats,
                });
                Ok(true)
            }
            Err(e) => {
                tracing::error!(level, error = %e, "compaction step failed");
                self.publish(Event::Error {
                    code: e.code(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Run merge steps until no level is over budget.
    pub fn run_compactions(&mut self) -> KvResult<()> {
        while self.run_compaction_step()? {}
        Ok(())
    }

    /// Scan a random sample of MemTable keys, degrading any expired entries
    /// observed along the way.
    pub fn sweep_expired(&mut self) {
        let now = self.clock.now_millis();
        let sample: Vec<String> = {
            let mut rng = rand::rng();
            self.memtable
                .iter_keys()
                .choose_multiple(&mut rng, self.config.sweep_sample_size)
                .into_iter()
                .cloned()
                .collect()
        };
        for key in sample {
            let _ = self.memtable.lookup_raw(&key, now);
        }
    }

    fn add_delta(&mut self, key: &str, delta: i64) -> KvResult<i64> {
        Self::validate_key(key)?;
        let now = self.clock.now_millis();
        let (current, expires_at) = match self.lookup_value(key, now) {
            Lookup::Live { value, expires_at } => {
                let parsed = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                (parsed, expires_at)
            }
            _ => (0, None),
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            KvError::Validation(format!("counter for key {key:?} would overflow"))
        })?;
        let value = Bytes::from(next.to_string());
        self.wal.append(Operation::Set {
            key: key.to_string(),
            value: value.clone(),
            ttl_ms: None,
        });
        // Counters keep whatever expiry the entry already carried.
        if let Err(e) = self
            .memtable
            .put_with_deadline(key.to_string(), value.clone(), expires_at, now)
        {
            self.rollback_write(&e);
            return Err(e);
        }
        self.publish(Event::Set {
            key: key.to_string(),
            value,
            ttl_ms: None,
        });
        self.maybe_flush()?;
        Ok(next)
    }

    /// Merged read: first raw occurrence of the key wins, scanning the
    /// MemTable, then L0 newest to oldest, then each deeper level.
    fn lookup_value(&mut self, key: &str, now: u64) -> Lookup {
        match self.memtable.lookup_raw(key, now) {
            RawLookup::Live(entry) => {
                if let crate::memtable::EntryValue::Present(v) = &entry.value {
                    return Lookup::Live {
                        value: v.clone(),
                        expires_at: entry.expires_at,
                    };
                }
                return Lookup::Shadowed;
            }
            RawLookup::Tombstone => return Lookup::Shadowed,
            RawLookup::Absent => {}
        }

        for run in self.levels[0].iter().rev() {
            if !run.may_contain(key) {
                continue;
            }
            if let Some(entry) = run.lookup(key) {
                return Self::classify(entry, now);
            }
        }
        for level in self.levels.iter().skip(1) {
            // Disjoint ranges: at most one run per level can hold the key.
            for run in level {
                if !run.may_contain(key) {
                    continue;
                }
                if let Some(entry) = run.lookup(key) {
                    return Self::classify(entry, now);
                }
            }
        }
        Lookup::Absent
    }

    fn classify(entry: &Entry, now: u64) -> Lookup {
        if entry.is_expired(now) || entry.is_tombstone() {
            return Lookup::Shadowed;
        }
        match &entry.value {
            crate::memtable::EntryValue::Present(v) => Lookup::Live {
                value: v.clone(),
                expires_at: entry.expires_at,
            },
            crate::memtable::EntryValue::Tombstone => Lookup::Shadowed,
        }
    }

    /// Visit the newest occurrence of every key across the MemTable and all
    /// runs, newest structures first.
    fn visit_newest_entries<'a>(&'a self, mut visit: impl FnMut(&'a Entry)) {
        let mut seen: HashSet<&str> = HashSet::new();
        for entry in self.memtable.iter_entries() {
            if seen.insert(entry.key.as_str()) {
                visit(entry);
            }
        }
        for run in self.levels[0].iter().rev() {
            for entry in run.entries() {
                if seen.insert(entry.key.as_str()) {
                    visit(entry);
                }
            }
        }
        for level in self.levels.iter().skip(1) {
            for run in level {
                for entry in run.entries() {
                    if seen.insert(entry.key.as_str()) {
                        visit(entry);
                    }
                }
            }
        }
    }

    fn maybe_flush(&mut self) -> KvResult<()> {
        if self.memtable.should_flush(self.config.memtable_size_bytes()) {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Undo the WAL append of a write whose MemTable mutation failed, and
    /// surface the fault to observers.
    fn rollback_write(&mut self, err: &KvError) {
        self.wal.truncate_last();
        self.publish(Event::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }

    fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn validate_key(key: &str) -> KvResult<()> {
        if key.is_empty() {
            return Err(KvError::Validation("key must not be empty".to_string()));
        }
        Ok(())
    }

    fn validate_ttl(ttl_ms: Option<u64>) -> KvResult<()> {
        match ttl_ms {
            Some(0) => Err(KvError::Validation(
                "ttl_ms must be strictly positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// MemTable statistics reported by INFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemtableInfo {
    pub size_bytes: u64,
    pub entry_count: u64,
    pub oldest_created_at: Option<u64>,
    pub newest_created_at: Option<u64>,
}

/// Engine statistics in the canonical INFO shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    pub memtable: MemtableInfo,
    pub runs: Vec<SsTableMeta>,
    pub total_size_bytes: u64,
    pub total_entries: u64,
    pub compaction_history: Vec<CompactionStats>,
}

impl StoreInfo {
    /// Serialize to JSON bytes for the external dispatcher.
    pub fn to_bytes(&self) -> KvResult<Bytes> {
        let json =
            serde_json::to_vec(self).map_err(|e| KvError::Serialization(e.to_string()))?;
        Ok(Bytes::from(json))
    }
}
