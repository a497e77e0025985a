//! Cache tier shared across gateway processes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;

use super::glob_matches;
use crate::ApiError;

type TierFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Distributed key/value tier. Every failure is a `cache.unavailable` error
/// which the request cache absorbs.
pub trait SharedTier: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> TierFuture<'a, Option<String>>;

    /// Last write wins; values are replaced whole.
    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> TierFuture<'a, ()>;

    /// Delete keys matching a glob pattern and return how many were removed.
    fn invalidate<'a>(&'a self, pattern: &'a str) -> TierFuture<'a, u64>;
}

/// Shared tier kept in process memory.
///
/// Clones share storage. It can be switched offline to exercise degraded
/// operation.
#[derive(Debug, Clone, Default)]
pub struct InMemorySharedTier {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    offline: Arc<AtomicBool>,
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tier that fails every operation.
    pub fn unreachable() -> Self {
        let tier = Self::default();
        tier.set_reachable(false);
        tier
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.offline.store(!reachable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("shared tier mutex should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::cache_unavailable("shared cache tier is offline"));
        }
        Ok(())
    }
}

impl SharedTier for InMemorySharedTier {
    fn get<'a>(&'a self, key: &'a str) -> TierFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check_reachable()?;
            let mut entries = self
                .entries
                .lock()
                .expect("shared tier mutex should not be poisoned");
            let fresh = entries
                .get(key)
                .map(|(value, expires_at)| (Instant::now() < *expires_at).then(|| value.clone()));
            match fresh {
                Some(Some(value)) => Ok(Some(value)),
                Some(None) => {
                    entries.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> TierFuture<'a, ()> {
        Box::pin(async move {
            self.check_reachable()?;
            self.entries
                .lock()
                .expect("shared tier mutex should not be poisoned")
                .insert(key.to_owned(), (value, Instant::now() + ttl));
            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, pattern: &'a str) -> TierFuture<'a, u64> {
        Box::pin(async move {
            self.check_reachable()?;
            let mut entries = self
                .entries
                .lock()
                .expect("shared tier mutex should not be poisoned");
            let before = entries.len();
            entries.retain(|key, _| !glob_matches(pattern, key));
            Ok((before - entries.len()) as u64)
        })
    }
}

/// Redis-backed shared tier over one lazily opened multiplexed connection.
pub struct RedisSharedTier {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisSharedTier {
    /// Validate the URL; no connection is made until first use.
    pub fn open(url: &str) -> Result<Self, ApiError> {
        let client = redis::Client::open(url)
            .map_err(|e| ApiError::cache_unavailable(format!("invalid cache url: {e}")))?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
            key_prefix: String::from("vidgate:"),
            op_timeout: Duration::from_millis(250),
        })
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    /// `SCAN MATCH` pattern selecting the same keys the local tier's
    /// `glob_matches` would: only `*` and `?` stay special.
    fn scan_pattern(&self, pattern: &str) -> String {
        let mut escaped = escape_redis_glob(&self.key_prefix);
        for ch in pattern.chars() {
            if matches!(ch, '[' | ']' | '\\') {
                escaped.push('\\');
            }
            escaped.push(ch);
        }
        escaped
    }

    async fn connection(&self) -> Result<MultiplexedConnection, ApiError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection =
            tokio::time::timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
                .await
                .map_err(|_| ApiError::cache_unavailable("timed out connecting to shared cache"))?
                .map_err(|e| {
                    ApiError::cache_unavailable(format!("shared cache connect failed: {e}"))
                })?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Run one command under the op timeout, dropping the connection on failure
    /// so the next call reconnects.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let connection = self.connection().await?;
        let outcome = tokio::time::timeout(self.op_timeout, op(connection)).await;
        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => ApiError::cache_unavailable(format!("shared cache command failed: {e}")),
            Err(_) => ApiError::cache_unavailable("shared cache command timed out"),
        };
        *self.connection.lock().await = None;
        Err(error)
    }
}

impl SharedTier for RedisSharedTier {
    fn get<'a>(&'a self, key: &'a str) -> TierFuture<'a, Option<String>> {
        let key = self.prefixed(key);
        Box::pin(async move {
            self.run(|mut connection| async move {
                let value: Option<String> = redis::cmd("GET")
                    .arg(&key)
                    .query_async(&mut connection)
                    .await?;
                Ok(value)
            })
            .await
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> TierFuture<'a, ()> {
        let key = self.prefixed(key);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        Box::pin(async move {
            self.run(|mut connection| async move {
                let _: () = redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut connection)
                    .await?;
                Ok(())
            })
            .await
        })
    }

    fn invalidate<'a>(&'a self, pattern: &'a str) -> TierFuture<'a, u64> {
        let pattern = self.scan_pattern(pattern);
        Box::pin(async move {
            self.run(|mut connection| async move {
                let mut cursor = 0_u64;
                let mut removed = 0_u64;
                loop {
                    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut connection)
                        .await?;
                    if !keys.is_empty() {
                        let deleted: u64 = redis::cmd("DEL")
                            .arg(&keys)
                            .query_async(&mut connection)
                            .await?;
                        removed += deleted;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(removed)
            })
            .await
        })
    }
}

/// Escape every character Redis glob matching treats as special.
fn escape_redis_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
