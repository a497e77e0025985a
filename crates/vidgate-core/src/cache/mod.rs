//! Two-tier response cache.
//!
//! Reads go local tier first, then the shared tier; shared hits are promoted
//! into the local tier. Writes go to both. A failing shared tier is logged and
//! skipped, never surfaced to the caller.

mod local;
mod policy;
mod shared;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use local::LocalTier;
pub use policy::CacheTtlPolicy;
pub use shared::{InMemorySharedTier, RedisSharedTier, SharedTier};

use crate::events::{EventBus, GatewayEvent};
use crate::ApiError;

/// A cached payload. Valid while `now - cached_at < ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: String,
    pub cached_at_ms: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            cached_at_ms: now_millis(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at_ms) < self.ttl_ms
    }

    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        let age = now_ms.saturating_sub(self.cached_at_ms);
        Duration::from_millis(self.ttl_ms.saturating_sub(age))
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub shared_errors: u64,
    pub local_entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    shared_errors: AtomicU64,
}

/// Local tier plus an optional shared tier.
pub struct RequestCache {
    local: LocalTier,
    shared: Option<Arc<dyn SharedTier>>,
    counters: Counters,
    events: Option<EventBus>,
}

impl RequestCache {
    pub fn new(local: LocalTier, shared: Option<Arc<dyn SharedTier>>) -> Self {
        Self {
            local,
            shared,
            counters: Counters::default(),
            events: None,
        }
    }

    pub fn local_only(local: LocalTier) -> Self {
        Self::new(local, None)
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.local.get(key).await {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.payload);
        }

        if let Some(shared) = &self.shared {
            match shared.get(key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                    Ok(entry) if entry.key == key && entry.is_valid_at(now_millis()) => {
                        self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                        let payload = entry.payload.clone();
                        self.local.put(entry).await;
                        return Some(payload);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(key, %error, "discarding undecodable shared cache entry");
                    }
                },
                Ok(None) => {}
                Err(error) => self.degrade("get", &error),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write-through to both tiers.
    pub async fn set(&self, key: &str, payload: String, ttl: Duration) {
        let entry = CacheEntry::new(key, payload, ttl);

        if let Some(shared) = &self.shared {
            match serde_json::to_string(&entry) {
                Ok(raw) => {
                    if let Err(error) = shared.set(key, raw, ttl).await {
                        self.degrade("set", &error);
                    }
                }
                Err(error) => tracing::warn!(key, %error, "failed to encode cache entry"),
            }
        }

        self.local.put(entry).await;
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.get(key).await?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(key, %error, "cached payload no longer decodes; treating as miss");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(payload) => self.set(key, payload, ttl).await,
            Err(error) => tracing::warn!(key, %error, "failed to encode value for cache"),
        }
    }

    /// Remove keys matching a glob (`*`, `?`) from both tiers.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let mut removed = self.local.invalidate(pattern).await as u64;
        if let Some(shared) = &self.shared {
            match shared.invalidate(pattern).await {
                Ok(count) => removed = removed.max(count),
                Err(error) => self.degrade("invalidate", &error),
            }
        }
        tracing::debug!(pattern, removed, "cache invalidated");
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            shared_errors: self.counters.shared_errors.load(Ordering::Relaxed),
            local_entries: self.local.len().await,
        }
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    fn degrade(&self, operation: &'static str, error: &ApiError) {
        self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            operation,
            error = %error,
            "shared cache tier unavailable; using local tier only"
        );
        if let Some(events) = &self.events {
            events.publish(GatewayEvent::CacheDegraded {
                reason: error.message().to_owned(),
            });
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Glob match supporting `*` (any run) and `?` (any single character).
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_shared(shared: &InMemorySharedTier) -> RequestCache {
        RequestCache::new(
            LocalTier::new(16, Duration::from_secs(60)),
            Some(Arc::new(shared.clone())),
        )
    }

    #[test]
    fn glob_supports_star_and_question_mark() {
        assert!(glob_matches("search:*", "search:q=rust:max=25"));
        assert!(glob_matches("video_?etails:*", "video_details:abc"));
        assert!(glob_matches("*", ""));
        assert!(glob_matches("*:abc", "video_stats:abc"));
        assert!(!glob_matches("search:*", "video_details:abc"));
        assert!(!glob_matches("video_details:a?", "video_details:abc"));
    }

    #[test]
    fn entry_validity_is_strictly_inside_ttl() {
        let entry = CacheEntry {
            key: String::from("k"),
            payload: String::from("v"),
            cached_at_ms: 1_000,
            ttl_ms: 500,
        };
        assert!(entry.is_valid_at(1_499));
        assert!(!entry.is_valid_at(1_500));
        assert_eq!(entry.remaining_ttl(1_200), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn shared_hits_are_promoted_into_the_local_tier() {
        let shared = InMemorySharedTier::new();
        let writer = cache_with_shared(&shared);
        writer.set("k", String::from("v"), Duration::from_secs(60)).await;

        let reader = cache_with_shared(&shared);
        assert_eq!(reader.get("k").await.as_deref(), Some("v"));
        assert_eq!(reader.get("k").await.as_deref(), Some("v"));

        let stats = reader.stats().await;
        assert_eq!(stats.shared_hits, 1);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.local_entries, 1);
    }

    #[tokio::test]
    async fn unreachable_shared_tier_degrades_to_local_only() {
        let shared = InMemorySharedTier::unreachable();
        let events = EventBus::new(8);
        let mut receiver = events.subscribe();
        let cache = cache_with_shared(&shared).with_events(events);

        cache.set("k", String::from("v"), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.get("missing").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.shared_errors, 2);
        assert_eq!(stats.misses, 1);
        assert!(matches!(
            receiver.try_recv(),
            Ok(GatewayEvent::CacheDegraded { .. })
        ));
    }

    #[tokio::test]
    async fn json_helpers_round_trip_empty_collections() {
        let cache = RequestCache::local_only(LocalTier::default());
        let empty: Vec<String> = Vec::new();
        cache.set_json("empty", &empty, Duration::from_secs(60)).await;

        let cached: Option<Vec<String>> = cache.get_json("empty").await;
        assert_eq!(cached, Some(Vec::new()));
    }

    #[tokio::test]
    async fn invalidation_reaches_both_tiers() {
        let shared = InMemorySharedTier::new();
        let cache = cache_with_shared(&shared);
        cache.set("search:a", String::from("1"), Duration::from_secs(60)).await;
        cache.set("search:b", String::from("2"), Duration::from_secs(60)).await;
        cache.set("video_details:x", String::from("3"), Duration::from_secs(60)).await;

        assert_eq!(cache.invalidate("search:*").await, 2);
        assert_eq!(shared.len(), 1);
        assert_eq!(cache.get("search:a").await, None);
        assert_eq!(cache.get("video_details:x").await.as_deref(), Some("3"));
    }
}
