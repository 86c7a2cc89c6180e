//! Keyed response cache.
//!
//! Plain data structure; the optimizer owns it behind its state mutex.

use crate::request::{CacheKey, CachePolicy};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Value,
    pub stored_at: Instant,
    pub is_revalidating: bool,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }
}

/// Counters exposed through `ApiOptimizationService::cache_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Serve `data`; when `revalidate` is set the caller owns the background
    /// refresh (the entry is already flagged as revalidating).
    Hit { data: Value, revalidate: bool },
    Miss,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<CacheKey, CacheEntry>,
    stats: CacheStats,
}

impl ResponseCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look `key` up under `policy`.
    ///
    /// Fresh means younger than `max_age`. With stale-while-revalidate, an
    /// entry up to `max_age + stale_window` old is still served. Either way a
    /// stale-while-revalidate hit asks for one refresh unless one is running.
    pub fn lookup(&mut self, key: &CacheKey, policy: &CachePolicy, now: Instant) -> Lookup {
        let Some(entry) = self.entries.get_mut(key) else {
            self.stats.misses += 1;
            return Lookup::Miss;
        };

        let age = entry.age(now);
        if age < policy.max_age {
            self.stats.hits += 1;
        } else if policy.stale_while_revalidate
            && age < policy.max_age.saturating_add(policy.stale_window)
        {
            self.stats.stale_hits += 1;
        } else {
            self.stats.misses += 1;
            return Lookup::Miss;
        }

        let revalidate = policy.stale_while_revalidate && !entry.is_revalidating;
        if revalidate {
            entry.is_revalidating = true;
        }
        Lookup::Hit {
            data: entry.data.clone(),
            revalidate,
        }
    }

    /// Store `data`, replacing any previous entry and clearing its revalidation flag.
    pub fn insert(&mut self, key: CacheKey, data: Value, policy: &CachePolicy, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                data,
                stored_at: now,
                is_revalidating: false,
                tags: policy.tags.iter().cloned().collect(),
            },
        );
    }

    pub fn end_revalidation(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.is_revalidating = false;
        }
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry labelled `tag`; returns how many were removed.
    pub fn invalidate_tag(&mut self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.tags.contains(tag));
        before - self.entries.len()
    }

    /// Drop entries older than `max_entry_age`, whatever their freshness policy.
    pub fn sweep(&mut self, max_entry_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.age(now) <= max_entry_age);
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}
