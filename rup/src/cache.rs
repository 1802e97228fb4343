//! Per-dataset cache of normalized record sets.
//!
//! Entries expire a fixed time after they were written. An expired entry is
//! a miss for [`CacheStore::get`] but stays available through
//! [`CacheStore::get_stale`] until it is overwritten, deleted or evicted, so a
//! failed refetch can still be answered with the last good data.

use crate::metrics_defs::{CACHE_ENTRIES, CACHE_HIT, CACHE_MISS};
use crate::types::{DatasetKey, RecordSet};
use parking_lot::RwLock;
use serde::Serialize;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Source of the current time, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry {
    records: RecordSet,
    written_at: Instant,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries that have not expired yet.
    pub keys: usize,
}

pub struct CacheStore {
    entries: RwLock<HashMap<DatasetKey, CacheEntry>>,
    ttl: Duration,
    max_entries: Option<usize>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new(ttl: Duration, max_entries: Option<usize>, clock: Arc<dyn Clock>) -> Self {
        CacheStore {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the records for `key` if an unexpired entry exists.
    pub fn get(&self, key: &DatasetKey) -> Option<RecordSet> {
        let now = self.clock.now();
        let fresh = self
            .entries
            .read()
            .get(key)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.records.clone());

        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(CACHE_HIT).increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(CACHE_MISS).increment(1);
        }
        fresh
    }

    /// Returns the records for `key` whether or not the entry has expired.
    pub fn get_stale(&self, key: &DatasetKey) -> Option<RecordSet> {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.records.clone())
    }

    /// Stores `records` under `key`, replacing any previous entry.
    pub fn set(&self, key: DatasetKey, records: RecordSet) {
        let now = self.clock.now();
        let mut entries = self.entries.write();

        if let Some(max) = self.max_entries
            && !entries.contains_key(&key)
            && entries.len() >= max
        {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.written_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(key = %oldest, "evicting oldest cache entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                records,
                written_at: now,
            },
        );
        gauge!(CACHE_ENTRIES).set(entries.len() as f64);
    }

    /// Removes the entry for `key`, returning whether one existed.
    pub fn delete(&self, key: &DatasetKey) -> bool {
        let mut entries = self.entries.write();
        let removed = entries.remove(key).is_some();
        gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let keys = self
            .entries
            .read()
            .values()
            .filter(|entry| self.is_fresh(entry, now))
            .count();

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys,
        }
    }

    /// All keys currently held, expired or not, in display order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.written_at) < self.ttl
    }
}
