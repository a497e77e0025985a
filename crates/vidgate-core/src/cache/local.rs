//! Bounded in-process cache tier.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{glob_matches, now_millis, CacheEntry};

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    generation: u64,
    stored_at: Instant,
}

#[derive(Debug)]
struct LocalInner {
    map: HashMap<String, Slot>,
    /// Insertion order; entries whose generation no longer matches the map
    /// were overwritten and are skipped.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
    capacity: usize,
    max_age: Duration,
}

impl LocalInner {
    fn get(&self, key: &str, now_ms: u64) -> Option<CacheEntry> {
        let slot = self.map.get(key)?;
        if slot.stored_at.elapsed() >= self.max_age || !slot.entry.is_valid_at(now_ms) {
            return None;
        }
        Some(slot.entry.clone())
    }

    fn put(&mut self, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.order.push_back((entry.key.clone(), generation));
        self.map.insert(
            entry.key.clone(),
            Slot {
                entry,
                generation,
                stored_at: Instant::now(),
            },
        );

        self.evict();
    }

    fn evict(&mut self) {
        if self.map.len() > self.capacity {
            self.purge_expired(now_millis());
        }

        while self.map.len() > self.capacity {
            let Some((key, generation)) = self.order.pop_front() else {
                break;
            };
            if self
                .map
                .get(&key)
                .is_some_and(|slot| slot.generation == generation)
            {
                self.map.remove(&key);
            }
        }

        if self.order.len() > self.capacity.saturating_mul(2).max(16) {
            self.compact_order();
        }
    }

    fn purge_expired(&mut self, now_ms: u64) -> usize {
        let max_age = self.max_age;
        let before = self.map.len();
        self.map.retain(|_, slot| {
            slot.stored_at.elapsed() < max_age && slot.entry.is_valid_at(now_ms)
        });
        before - self.map.len()
    }

    fn compact_order(&mut self) {
        let map = &self.map;
        self.order.retain(|(key, generation)| {
            map.get(key)
                .is_some_and(|slot| slot.generation == *generation)
        });
    }

    fn invalidate(&mut self, pattern: &str) -> usize {
        let before = self.map.len();
        self.map.retain(|key, _| !glob_matches(pattern, key));
        let removed = before - self.map.len();
        if removed > 0 {
            self.compact_order();
        }
        removed
    }
}

/// Size- and age-bounded local tier. Oldest insertions are evicted first.
#[derive(Debug, Clone)]
pub struct LocalTier {
    inner: Arc<tokio::sync::RwLock<LocalInner>>,
}

impl LocalTier {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(LocalInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                next_generation: 0,
                capacity,
                max_age,
            })),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let store = self.inner.read().await;
        store.get(key, now_millis())
    }

    /// Store an entry, replacing any previous entry for the key.
    pub async fn put(&self, entry: CacheEntry) {
        let mut store = self.inner.write().await;
        store.put(entry);
    }

    pub async fn invalidate(&self, pattern: &str) -> usize {
        let mut store = self.inner.write().await;
        store.invalidate(pattern)
    }

    pub async fn purge_expired(&self) -> usize {
        let mut store = self.inner.write().await;
        store.purge_expired(now_millis())
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        let store = self.inner.read().await;
        store.map.len()
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3_600))
    }
}
