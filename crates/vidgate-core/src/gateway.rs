//! Process-wide gateway context.
//!
//! A [`Gateway`] owns one quota ledger, one cache, one job queue and the
//! worker pool draining it. Build it once with [`GatewayBuilder`] and share it
//! by reference or `Arc`.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::{CacheStats, LocalTier, RedisSharedTier, RequestCache, SharedTier};
use crate::client::VideoApiClient;
use crate::config::{ConfigError, GatewayConfig};
use crate::credentials::{CredentialVault, InMemoryVault};
use crate::events::{EventBus, GatewayEvent};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::oauth::{DisabledTokenRefresher, HttpTokenRefresher, OAuthTokenManager, TokenRefresher};
use crate::quota::{
    InMemoryQuotaStore, QuotaCostTable, QuotaError, QuotaLedger, QuotaSnapshot, QuotaStore,
};
use crate::retry::RetryPolicy;
use crate::scheduler::{
    Dispatcher, JobHandle, JobId, JobQueue, JobRequest, JobSnapshot, QueuePolicies, QueueStats,
    RetentionPolicy, WorkerPool,
};
use crate::ApiError;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Failure to assemble a [`Gateway`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("quota ledger could not be opened: {0}")]
    Quota(#[from] QuotaError),

    #[error("shared cache could not be opened: {0}")]
    SharedCache(ApiError),
}

/// Collects collaborators; anything not supplied gets a production default.
#[derive(Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
    http: Option<Arc<dyn HttpClient>>,
    vault: Option<Arc<dyn CredentialVault>>,
    shared_tier: Option<Arc<dyn SharedTier>>,
    quota_store: Option<Arc<dyn QuotaStore>>,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
    local_tier: Option<LocalTier>,
    policies: QueuePolicies,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    costs: QuotaCostTable,
    event_capacity: Option<usize>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Builder seeded from the process environment.
    pub fn from_env() -> Result<Self, GatewayError> {
        Ok(Self::new(GatewayConfig::from_env()?))
    }

    #[must_use]
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    #[must_use]
    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Overrides `cache_url` from the config.
    #[must_use]
    pub fn with_shared_tier(mut self, shared: Arc<dyn SharedTier>) -> Self {
        self.shared_tier = Some(shared);
        self
    }

    #[must_use]
    pub fn with_quota_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.quota_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.token_refresher = Some(refresher);
        self
    }

    #[must_use]
    pub fn with_local_tier(mut self, local: LocalTier) -> Self {
        self.local_tier = Some(local);
        self
    }

    #[must_use]
    pub fn with_queue_policies(mut self, policies: QueuePolicies) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn with_cost_table(mut self, costs: QuotaCostTable) -> Self {
        self.costs = costs;
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        let events = EventBus::new(self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY));

        let shared = match (self.shared_tier, config.cache_url.as_deref()) {
            (Some(shared), _) => Some(shared),
            (None, Some(url)) => Some(Arc::new(
                RedisSharedTier::open(url).map_err(GatewayError::SharedCache)?,
            ) as Arc<dyn SharedTier>),
            (None, None) => None,
        };
        let cache = Arc::new(
            RequestCache::new(self.local_tier.unwrap_or_default(), shared)
                .with_events(events.clone()),
        );

        let store: Arc<dyn QuotaStore> = self
            .quota_store
            .unwrap_or_else(|| Arc::new(InMemoryQuotaStore::new()));
        let ledger = Arc::new(QuotaLedger::open(config.daily_quota, config.quota_reset, store)?);

        let http: Arc<dyn HttpClient> = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));
        let refresher: Arc<dyn TokenRefresher> = match (
            self.token_refresher,
            config.oauth_client.as_ref(),
        ) {
            (Some(refresher), _) => refresher,
            (None, Some(client)) => Arc::new(
                HttpTokenRefresher::new(
                    Arc::clone(&http),
                    client.token_url.clone(),
                    client.client_id.clone(),
                    client.client_secret.clone(),
                )
                .with_timeout_ms(duration_ms(config.request_timeout)),
            ),
            (None, None) => Arc::new(DisabledTokenRefresher),
        };
        let tokens = Arc::new(OAuthTokenManager::new(refresher));
        let vault: Arc<dyn CredentialVault> = self
            .vault
            .unwrap_or_else(|| Arc::new(InMemoryVault::new()));

        let client = VideoApiClient::new(http, config.api_base_url.clone())
            .with_timeout(config.request_timeout)
            .with_cost_table(self.costs);

        let queue = Arc::new(
            JobQueue::new(Arc::clone(&ledger), events.clone())
                .with_policies(self.policies)
                .with_retry_policy(self.retry)
                .with_retention(self.retention)
                .with_cost_table(self.costs),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            Arc::clone(&cache),
            client,
            tokens,
            vault,
            config.api_key.clone(),
            config.ttl,
            events.clone(),
        ));

        tracing::debug!(
            daily_quota = config.daily_quota,
            shared_cache = cache.has_shared_tier(),
            "gateway assembled"
        );

        Ok(Gateway {
            config,
            ledger,
            cache,
            queue,
            dispatcher,
            events,
            workers: Mutex::new(None),
        })
    }
}

/// The gateway context: submit jobs, poll them, inspect quota and cache.
pub struct Gateway {
    config: GatewayConfig,
    ledger: Arc<QuotaLedger>,
    cache: Arc<RequestCache>,
    queue: Arc<JobQueue>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    workers: Mutex<Option<WorkerPool>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Start the worker pool. Jobs enqueued earlier are picked up now.
    /// Calling it again while running does nothing.
    pub fn start(&self) {
        let mut workers = self.workers_lock();
        if workers.is_none() {
            *workers = Some(WorkerPool::start(
                Arc::clone(&self.queue),
                Arc::clone(&self.dispatcher),
                self.queue.policies(),
            ));
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers_lock().is_some()
    }

    /// Stop the workers after their in-flight jobs, then fail whatever is
    /// still waiting so no handle stays pending forever.
    pub async fn shutdown(&self) {
        let workers = self.workers_lock().take();
        if let Some(workers) = workers {
            workers.shutdown().await;
        }
        let abandoned = self.queue.abandon_pending("gateway shut down before the job started");
        if abandoned > 0 {
            tracing::info!(abandoned, "failed jobs left in the queue at shutdown");
        }
    }

    pub fn enqueue(&self, request: JobRequest) -> Result<JobHandle, ApiError> {
        self.queue.enqueue(request)
    }

    pub fn status(&self, id: JobId) -> Option<JobSnapshot> {
        self.queue.snapshot(id)
    }

    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queue.stats()
    }

    pub fn quota(&self) -> QuotaSnapshot {
        self.ledger.snapshot()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Drop cached entries whose key matches the glob `pattern`.
    pub async fn invalidate_cache(&self, pattern: &str) -> u64 {
        self.cache.invalidate(pattern).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn workers_lock(&self) -> std::sync::MutexGuard<'_, Option<WorkerPool>> {
        self.workers
            .lock()
            .expect("gateway worker slot should not be poisoned")
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
