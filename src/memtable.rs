//! Mutable in-memory write buffer (MemTable).
//!
//! The only mutable store of entries, ordered by key. Each key holds at most
//! one entry: the latest versioned value or a tombstone. The executor owns
//! the table exclusively, so mutators take `&mut self` and no locking is
//! involved.

use crate::{KvError, KvResult};
use bytes::Bytes;

use std::collections::BTreeMap;

/// The value side of an entry: a live payload or a deletion marker.
///
/// A tombstone is a distinguished state, not a sentinel value — it shadows
/// older entries for the same key in deeper runs until compaction at the
/// bottom level drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    Present(Bytes),
    Tombstone,
}

impl EntryValue {
    /// Byte cost of the payload (tombstones carry no payload).
    pub fn size_bytes(&self) -> usize {
        match self {
            EntryValue::Present(v) => v.len(),
            EntryValue::Tombstone => 0,
        }
    }
}

/// The unit of storage, in the MemTable and in immutable runs alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: EntryValue,
    /// Absolute millisecond timestamp at write.
    pub created_at: u64,
    /// Absolute millisecond expiry; `None` means no expiry.
    pub expires_at: Option<u64>,
    /// Per-key write version; a rewrite gets a strictly larger version.
    pub version: u32,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, EntryValue::Tombstone)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Live means visible to readers: neither tombstoned nor expired.
    pub fn is_live(&self, now: u64) -> bool {
        !self.is_tombstone() && !self.is_expired(now)
    }

    /// Approximate byte cost: key + payload + created_at (8) + expires_at
    /// (8, when set) + version (4).
    pub fn cost(&self) -> usize {
        self.key.len()
            + self.value.size_bytes()
            + 8
            + if self.expires_at.is_some() { 8 } else { 0 }
            + 4
    }
}

/// Result of a raw MemTable probe, for the engine's merge logic. The public
/// command surface treats `Tombstone` and `Absent` identically; the read
/// path needs the distinction to decide whether deeper runs are consulted.
#[derive(Debug)]
pub enum RawLookup<'a> {
    Live(&'a Entry),
    Tombstone,
    Absent,
}

/// The mutable sorted buffer of recent writes.
#[derive(Debug, Default)]
pub struct MemTable {
    data: BTreeMap<String, Entry>,
    size_bytes: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a live value. `expires_at = now + ttl_ms` when a
    /// TTL is given.
    pub fn put(&mut self, key: String, value: Bytes, ttl_ms: Option<u64>, now: u64) -> KvResult<()> {
        let expires_at = ttl_ms.map(|ttl| now + ttl);
        self.insert_entry(key, EntryValue::Present(value), expires_at, now)
    }

    /// Insert or overwrite a live value with an absolute expiry deadline.
    /// Used by counter updates, which preserve the remaining expiry.
    pub fn put_with_deadline(
        &mut self,
        key: String,
        value: Bytes,
        expires_at: Option<u64>,
        now: u64,
    ) -> KvResult<()> {
        self.insert_entry(key, EntryValue::Present(value), expires_at, now)
    }

    /// Write a tombstone for the key (not a physical removal, so the delete
    /// stays visible through deeper runs). Returns whether a live entry
    /// existed in this table.
    pub fn delete(&mut self, key: &str, now: u64) -> KvResult<bool> {
        let was_live = matches!(self.lookup_raw(key, now), RawLookup::Live(_));
        self.insert_entry(key.to_string(), EntryValue::Tombstone, None, now)?;
        Ok(was_live)
    }

    /// Update the expiry of a live entry. Returns whether one existed.
    pub fn expire(&mut self, key: &str, ttl_ms: u64, now: u64) -> bool {
        if !matches!(self.lookup_raw(key, now), RawLookup::Live(_)) {
            return false;
        }
        if let Some(entry) = self.data.get_mut(key) {
            if entry.expires_at.is_none() {
                self.size_bytes += 8;
            }
            entry.expires_at = Some(now + ttl_ms);
            true
        } else {
            false
        }
    }

    /// Raw probe distinguishing tombstones from plain misses.
    ///
    /// An expired entry is degraded to a tombstone in place: its payload
    /// cost is released, and the tombstone keeps shadowing whatever older
    /// versions of the key deeper runs may hold.
    pub fn lookup_raw(&mut self, key: &str, now: u64) -> RawLookup<'_> {
        let Some(entry) = self.data.get_mut(key) else {
            return RawLookup::Absent;
        };
        if entry.is_expired(now) {
            let released = entry.value.size_bytes() + 8;
            entry.value = EntryValue::Tombstone;
            entry.expires_at = None;
            self.size_bytes = self.size_bytes.saturating_sub(released);
            return RawLookup::Tombstone;
        }
        match entry.value {
            EntryValue::Tombstone => RawLookup::Tombstone,
            EntryValue::Present(_) => RawLookup::Live(entry),
        }
    }

    /// Value lookup with public-surface semantics: tombstoned and expired
    /// entries read as absent.
    pub fn get(&mut self, key: &str, now: u64) -> Option<Bytes> {
        match self.lookup_raw(key, now) {
            RawLookup::Live(entry) => match &entry.value {
                EntryValue::Present(v) => Some(v.clone()),
                EntryValue::Tombstone => None,
            },
            _ => None,
        }
    }

    /// Remaining TTL in whole seconds (ceiling): `-2` absent, `-1` present
    /// without expiry.
    pub fn ttl(&mut self, key: &str, now: u64) -> i64 {
        match self.lookup_raw(key, now) {
            RawLookup::Live(entry) => match entry.expires_at {
                None => -1,
                Some(at) => remaining_seconds(at, now),
            },
            _ => -2,
        }
    }

    /// Live keys matching the pattern, in key order.
    pub fn keys(&self, pattern: &crate::pattern::KeyPattern, now: u64) -> Vec<String> {
        self.data
            .values()
            .filter(|e| e.is_live(now) && pattern.matches(&e.key))
            .map(|e| e.key.clone())
            .collect()
    }

    /// All entries, including tombstones.
    pub fn iter_entries(&self) -> impl Iterator<Item = &Entry> {
        self.data.values()
    }

    /// All keys, including tombstoned ones.
    pub fn iter_keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Drain every unexpired entry (tombstones included) in ascending key
    /// order, leaving the table empty. Used at flush time.
    pub fn take_sorted(&mut self, now: u64) -> Vec<Entry> {
        let data = std::mem::take(&mut self.data);
        self.size_bytes = 0;
        data.into_values().filter(|e| !e.is_expired(now)).collect()
    }

    /// Oldest and newest `created_at` across all entries.
    pub fn created_at_range(&self) -> (Option<u64>, Option<u64>) {
        let oldest = self.data.values().map(|e| e.created_at).min();
        let newest = self.data.values().map(|e| e.created_at).max();
        (oldest, newest)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn should_flush(&self, threshold_bytes: usize) -> bool {
        self.size_bytes >= threshold_bytes
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.size_bytes = 0;
    }

    fn insert_entry(
        &mut self,
        key: String,
        value: EntryValue,
        expires_at: Option<u64>,
        now: u64,
    ) -> KvResult<()> {
        let version = match self.data.get(&key) {
            Some(prev) => prev.version.checked_add(1).ok_or_else(|| {
                KvError::Storage(format!("version counter overflow for key {key:?}"))
            })?,
            None => 1,
        };
        let entry = Entry {
            key: key.clone(),
            value,
            created_at: now,
            expires_at,
            version,
        };
        let cost = entry.cost();
        if let Some(old) = self.data.insert(key, entry) {
            self.size_bytes = self.size_bytes.saturating_sub(old.cost());
        }
        self.size_bytes += cost;
        Ok(())
    }
}

/// Whole seconds until `deadline`, rounded up.
pub(crate) fn remaining_seconds(deadline: u64, now: u64) -> i64 {
    ((deadline - now + 999) / 1_000) as i64
}
