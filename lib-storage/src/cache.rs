//! Multi-level in-memory cache
//!
//! Three logical levels under one global LRU ordering. A full L1 demotes
//! its least-recently-used entry to L2 instead of discarding it, L2 demotes
//! to L3, and L3 is unbounded (the TTL sweep is what empties it). Hits in
//! L2 or L3 promote the entry one level up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    fn below(&self) -> Option<CacheLevel> {
        match self {
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }

    fn above(&self) -> Option<CacheLevel> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub ttl_ms: u64,
    pub created_at: u64,
    pub accessed_at: u64,
    pub level: CacheLevel,
    /// Global monotonic access stamp; the LRU victim is the minimum.
    pub access_order: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) >= self.ttl_ms
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Demotions count as evictions from their source level.
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The cache proper. Single-lock discipline: wrap in [`SharedCache`] for
/// concurrent use.
pub struct MultiTierCache {
    l1: HashMap<String, CacheEntry>,
    l2: HashMap<String, CacheEntry>,
    l3: HashMap<String, CacheEntry>,
    max_l1: usize,
    max_l2: usize,
    access_counter: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub type SharedCache = Arc<Mutex<MultiTierCache>>;

impl MultiTierCache {
    pub fn new(max_l1: usize, max_l2: usize) -> Self {
        Self {
            l1: HashMap::new(),
            l2: HashMap::new(),
            l3: HashMap::new(),
            max_l1,
            max_l2,
            access_counter: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn into_shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    fn level_map(&mut self, level: CacheLevel) -> &mut HashMap<String, CacheEntry> {
        match level {
            CacheLevel::L1 => &mut self.l1,
            CacheLevel::L2 => &mut self.l2,
            CacheLevel::L3 => &mut self.l3,
        }
    }

    fn next_order(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    /// Insert at the requested level (default L1), demoting as needed.
    pub fn put(
        &mut self,
        key: &str,
        value: Value,
        ttl_ms: u64,
        level: Option<CacheLevel>,
    ) -> Result<(), StorageError> {
        if ttl_ms == 0 {
            return Err(StorageError::InvalidArgument("cache ttl must be positive".into()));
        }

        // A key lives in at most one level
        self.remove_everywhere(key);

        let level = level.unwrap_or(CacheLevel::L1);
        let now = now_millis();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            ttl_ms,
            created_at: now,
            accessed_at: now,
            level,
            access_order: self.next_order(),
        };
        self.level_map(level).insert(key.to_string(), entry);
        self.rebalance();
        Ok(())
    }

    /// Look a key up, searching L1 then L2 then L3 (or only `level` when
    /// given). Hits below L1 promote the entry one level up.
    pub fn get(&mut self, key: &str, level: Option<CacheLevel>) -> Option<Value> {
        let now = now_millis();
        let levels: &[CacheLevel] = match level {
            Some(ref l) => std::slice::from_ref(l),
            None => &[CacheLevel::L1, CacheLevel::L2, CacheLevel::L3],
        };

        for &l in levels {
            if let Some(entry) = self.level_map(l).get(key) {
                if entry.is_expired(now) {
                    self.level_map(l).remove(key);
                    self.evictions += 1;
                    self.misses += 1;
                    return None;
                }

                let order = self.next_order();
                let map = self.level_map(l);
                let mut entry = map.remove(key).expect("entry present");
                entry.accessed_at = now;
                entry.access_order = order;

                let target = l.above().unwrap_or(l);
                entry.level = target;
                let value = entry.value.clone();
                self.level_map(target).insert(key.to_string(), entry);
                if target != l {
                    debug!(key, from = ?l, to = ?target, "cache promotion");
                    self.rebalance();
                }

                self.hits += 1;
                return Some(value);
            }
        }

        self.misses += 1;
        None
    }

    /// Demote LRU victims until every bounded level fits. Promotion-driven
    /// and put-driven overflow both funnel through here, so an entry is
    /// never lost, only moved down.
    fn rebalance(&mut self) {
        while self.l1.len() > self.max_l1 {
            if let Some(key) = Self::lru_key(&self.l1) {
                let mut entry = self.l1.remove(&key).expect("victim present");
                entry.level = CacheLevel::L2;
                self.l2.insert(key, entry);
                self.evictions += 1;
            } else {
                break;
            }
        }
        while self.l2.len() > self.max_l2 {
            if let Some(key) = Self::lru_key(&self.l2) {
                let mut entry = self.l2.remove(&key).expect("victim present");
                entry.level = CacheLevel::L3;
                self.l3.insert(key, entry);
                self.evictions += 1;
            } else {
                break;
            }
        }
    }

    fn lru_key(map: &HashMap<String, CacheEntry>) -> Option<String> {
        map.values()
            .min_by_key(|e| e.access_order)
            .map(|e| e.key.clone())
    }

    /// Remove a key from every level.
    pub fn invalidate(&mut self, key: &str) -> bool {
        self.remove_everywhere(key)
    }

    fn remove_everywhere(&mut self, key: &str) -> bool {
        let mut removed = false;
        removed |= self.l1.remove(key).is_some();
        removed |= self.l2.remove(key).is_some();
        removed |= self.l3.remove(key).is_some();
        removed
    }

    /// Empty all levels and reset counters.
    pub fn clear(&mut self) {
        self.l1.clear();
        self.l2.clear();
        self.l3.clear();
        self.access_counter = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    /// Remove every expired entry from all levels.
    pub fn sweep_expired(&mut self, now_ms: u64) -> usize {
        let mut reaped = 0;
        for level in [CacheLevel::L1, CacheLevel::L2, CacheLevel::L3] {
            let map = self.level_map(level);
            let before = map.len();
            map.retain(|_, e| !e.is_expired(now_ms));
            reaped += before - map.len();
        }
        self.evictions += reaped as u64;
        if reaped > 0 {
            info!(reaped, "cache TTL sweep");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.l1.len() + self.l2.len() + self.l3.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn level_len(&self, level: CacheLevel) -> usize {
        match level {
            CacheLevel::L1 => self.l1.len(),
            CacheLevel::L2 => self.l2.len(),
            CacheLevel::L3 => self.l3.len(),
        }
    }

    /// Which level currently holds `key`, if any.
    pub fn level_of(&self, key: &str) -> Option<CacheLevel> {
        if self.l1.contains_key(key) {
            Some(CacheLevel::L1)
        } else if self.l2.contains_key(key) {
            Some(CacheLevel::L2)
        } else if self.l3.contains_key(key) {
            Some(CacheLevel::L3)
        } else {
            None
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size: self.len(),
        }
    }

    /// Background TTL sweep for a shared cache handle.
    pub fn spawn_sweeper(
        cache: SharedCache,
        sweep_interval_ms: u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.lock().sweep_expired(now_millis());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for MultiTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTierCache")
            .field("l1", &self.l1.len())
            .field("l2", &self.l2.len())
            .field("l3", &self.l3.len())
            .finish()
    }
}
