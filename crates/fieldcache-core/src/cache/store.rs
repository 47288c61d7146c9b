//! In-memory cache tier with freshness bands and LRU eviction.
//!
//! Entries move strictly forward through three bands relative to their age:
//! fresh (`age < fresh_window`), stale (`fresh_window <= age < stale_window`)
//! and expired. Expired entries are purged lazily by the read that finds them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use super::key::CacheKey;
use crate::clock::{self, Clock};
use crate::config::NamespaceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    pub fn classify(age: Duration, config: &NamespaceConfig) -> Self {
        if age < config.fresh_window() {
            Freshness::Fresh
        } else if age < config.stale_window() {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// A live (fresh or stale) entry returned by [`CacheStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub payload: T,
    pub is_fresh: bool,
    pub is_stale: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
    pub max_entries: usize,
}

struct Entry<T> {
    payload: T,
    created_at: DateTime<Utc>,
    touched: u64,
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    /// touch tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl<T> Inner<T> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.touched);
            entry.touched = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry<T>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.touched);
        Some(entry)
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// One namespace's in-memory tier. Shared by every caller through an `Arc`;
/// each operation takes the lock once and never yields while holding it.
pub struct CacheStore<T> {
    config: NamespaceConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> CacheStore<T> {
    pub fn new(config: NamespaceConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: NamespaceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Look up a live entry, marking it most recently used.
    ///
    /// Returns `None` for a key that was never set, and for an expired entry,
    /// which is deleted as a side effect.
    pub fn get(&self, key: impl AsRef<str>) -> Option<CacheHit<T>> {
        let key = key.as_ref();
        let now = self.clock.now();
        let mut inner = self.lock();

        let (freshness, created_at) = {
            let entry = inner.entries.get(key)?;
            (
                Freshness::classify(now - entry.created_at, &self.config),
                entry.created_at,
            )
        };

        if freshness == Freshness::Expired {
            inner.remove(key);
            debug!(key = key, "Cache entry expired, purged");
            return None;
        }

        inner.touch(key);
        let payload = inner.entries.get(key)?.payload.clone();
        Some(CacheHit {
            payload,
            is_fresh: freshness == Freshness::Fresh,
            is_stale: freshness == Freshness::Stale,
            created_at,
        })
    }

    /// Insert or replace `key` with `created_at = now`.
    ///
    /// Inserting a new key into a full store first evicts the least
    /// recently touched key.
    pub fn set(&self, key: impl AsRef<str>, payload: T) {
        let key = key.as_ref();
        if self.config.max_entries == 0 {
            return;
        }
        let now = self.clock.now();
        let mut inner = self.lock();

        if inner.remove(key).is_none() && inner.entries.len() >= self.config.max_entries {
            if let Some(evicted) = inner.evict_least_recent() {
                debug!(evicted = %evicted, max_entries = self.config.max_entries, "Cache full, evicted least recently used");
            }
        }

        let touched = inner.next_tick();
        inner.recency.insert(touched, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                payload,
                created_at: now,
                touched,
            },
        );
    }

    /// Seed an entry ahead of any request for it.
    pub fn preload(&self, key: impl AsRef<str>, payload: T) {
        let key = key.as_ref();
        self.set(key, payload);
        debug!(key = key, "Preloaded cache entry");
    }

    pub fn delete(&self, key: impl AsRef<str>) -> bool {
        self.lock().remove(key.as_ref()).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Remove every key in `namespace`. Returns how many were removed.
    pub fn clear_by_namespace(&self, namespace: &str) -> usize {
        let prefix = CacheKey::namespace_prefix(namespace);
        self.clear_matching(|key| key.starts_with(&prefix))
    }

    /// Remove every key for which `matches` holds. Returns how many were removed.
    pub fn clear_matching(&self, matches: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| matches(k.as_str()))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Presence check that neither touches recency nor purges.
    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.lock().entries.contains_key(key.as_ref())
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let inner = self.lock();
        let mut stats = CacheStats {
            total: inner.entries.len(),
            max_entries: self.config.max_entries,
            ..CacheStats::default()
        };
        for entry in inner.entries.values() {
            match Freshness::classify(now - entry.created_at, &self.config) {
                Freshness::Fresh => stats.fresh += 1,
                Freshness::Stale => stats.stale += 1,
                Freshness::Expired => stats.expired += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn store_with(config: NamespaceConfig) -> (CacheStore<i32>, ManualClock) {
        let clock = ManualClock::default();
        let store = CacheStore::with_clock(config, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_get_never_set_returns_none() {
        let (store, _) = store_with(NamespaceConfig::tabular());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let (store, _) = store_with(NamespaceConfig::new(100, 300, 2));
        store.set("a", 1);
        store.set("b", 2);
        store.set("c", 3);

        assert!(store.get("a").is_none());
        assert_eq!(store.get("b").map(|h| h.payload), Some(2));
        assert_eq!(store.get("c").map(|h| h.payload), Some(3));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let (store, _) = store_with(NamespaceConfig::new(100, 300, 2));
        store.set("a", 1);
        store.set("b", 2);
        assert!(store.get("a").is_some());
        store.set("c", 3);

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
    }

    #[test]
    fn test_replacing_existing_key_does_not_evict() {
        let (store, _) = store_with(NamespaceConfig::new(100, 300, 2));
        store.set("a", 1);
        store.set("b", 2);
        store.set("a", 10);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").map(|h| h.payload), Some(10));
        assert!(store.contains("b"));
    }

    #[test]
    fn test_freshness_bands() {
        let (store, clock) = store_with(NamespaceConfig::new(100, 300, 10));
        store.set("k", 7);

        let hit = store.get("k").expect("fresh hit");
        assert!(hit.is_fresh);
        assert!(!hit.is_stale);

        clock.advance_ms(150);
        let hit = store.get("k").expect("stale hit");
        assert!(!hit.is_fresh);
        assert!(hit.is_stale);
        assert_eq!(hit.payload, 7);

        clock.advance_ms(200);
        assert!(store.get("k").is_none());
        assert!(!store.contains("k"), "expired entry should be purged on read");
    }

    #[test]
    fn test_band_boundaries_are_half_open() {
        let (store, clock) = store_with(NamespaceConfig::new(100, 300, 10));
        store.set("k", 1);

        clock.advance_ms(100);
        assert!(store.get("k").map(|h| h.is_stale).unwrap_or(false));

        clock.advance_ms(200);
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_set_resets_age() {
        let (store, clock) = store_with(NamespaceConfig::new(100, 300, 10));
        store.set("k", 1);
        clock.advance_ms(250);
        store.set("k", 2);
        let hit = store.get("k").expect("hit");
        assert!(hit.is_fresh);
        assert_eq!(hit.payload, 2);
    }

    #[test]
    fn test_clear_by_namespace() {
        let (store, _) = store_with(NamespaceConfig::hierarchical());
        store.set(CacheKey::from_id("files", "a"), 1);
        store.set(CacheKey::from_id("files", "b"), 2);
        store.set(CacheKey::from_id("structure", "a"), 3);

        assert_eq!(store.clear_by_namespace("files"), 2);
        assert_eq!(store.len(), 1);
        assert!(store.contains("structure:a"));
    }

    #[test]
    fn test_delete_and_clear() {
        let (store, _) = store_with(NamespaceConfig::tabular());
        store.set("a", 1);
        store.set("b", 2);
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_stats_counts_bands() {
        let (store, clock) = store_with(NamespaceConfig::new(100, 300, 10));
        store.set("old", 1);
        clock.advance_ms(350);
        store.set("stale", 2);
        store.preload("preloaded", 3);
        clock.advance_ms(150);
        store.set("new", 4);

        let stats = store.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.stale, 2);
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.max_entries, 10);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let (store, _) = store_with(NamespaceConfig::new(100, 300, 0));
        store.set("a", 1);
        assert!(store.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8),
        Get(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..8).prop_map(Op::Set), (0u8..8).prop_map(Op::Get)]
    }

    proptest! {
        #[test]
        fn prop_capacity_and_lru_order(max in 1usize..5, ops in prop::collection::vec(op(), 1..60)) {
            let (store, _) = store_with(NamespaceConfig::new(1_000, 2_000, max));
            // least recently touched first
            let mut model: Vec<u8> = Vec::new();

            for op in ops {
                match op {
                    Op::Set(k) => {
                        if let Some(pos) = model.iter().position(|m| *m == k) {
                            model.remove(pos);
                        } else if model.len() >= max {
                            let evicted = model.remove(0);
                            store.set(k.to_string(), k as i32);
                            prop_assert!(!store.contains(evicted.to_string()));
                            model.push(k);
                            prop_assert!(store.len() <= max);
                            continue;
                        }
                        store.set(k.to_string(), k as i32);
                        model.push(k);
                    }
                    Op::Get(k) => {
                        let hit = store.get(k.to_string());
                        if let Some(pos) = model.iter().position(|m| *m == k) {
                            prop_assert_eq!(hit.map(|h| h.payload), Some(k as i32));
                            let k = model.remove(pos);
                            model.push(k);
                        } else {
                            prop_assert!(hit.is_none());
                        }
                    }
                }
                prop_assert!(store.len() <= max);
                prop_assert_eq!(store.len(), model.len());
            }
        }

        #[test]
        fn prop_freshness_is_monotonic(steps in prop::collection::vec(0i64..120, 1..20)) {
            let (store, clock) = store_with(NamespaceConfig::new(100, 300, 4));
            store.set("k", 1);
            let mut last = Freshness::Fresh;

            for step in steps {
                clock.advance_ms(step);
                let observed = match store.get("k") {
                    Some(hit) if hit.is_fresh => Freshness::Fresh,
                    Some(_) => Freshness::Stale,
                    None => Freshness::Expired,
                };
                prop_assert!(observed >= last);
                last = observed;
            }
        }
    }
}
