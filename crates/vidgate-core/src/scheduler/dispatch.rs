//! Runs claimed jobs: cache, quota, credentials, upstream call, resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheTtlPolicy, RequestCache};
use crate::client::{ClientAuth, VideoApiClient};
use crate::credentials::{CredentialVault, VaultRefreshObserver};
use crate::domain::{
    resource_cache_key, ChannelDetails, JobOutput, JobParams, OperationType, ResourceBatch,
    ResourceIds, UtcDateTime, VideoDetails, VideoStats,
};
use crate::events::{EventBus, GatewayEvent};
use crate::oauth::OAuthTokenManager;
use crate::quota::{QuotaLedger, QuotaReservation};
use crate::ApiError;

use super::queue::{Claim, ClaimedJob, JobQueue};

/// Entity returned by a batched id lookup and cached per id.
trait LookupItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn params(ids: ResourceIds) -> JobParams;
    fn from_output(output: JobOutput) -> Option<ResourceBatch<Self>>;
    fn into_output(batch: ResourceBatch<Self>) -> JobOutput;
}

impl LookupItem for VideoDetails {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(ids: ResourceIds) -> JobParams {
        JobParams::VideoDetails(ids)
    }

    fn from_output(output: JobOutput) -> Option<ResourceBatch<Self>> {
        match output {
            JobOutput::VideoDetails(batch) => Some(batch),
            _ => None,
        }
    }

    fn into_output(batch: ResourceBatch<Self>) -> JobOutput {
        JobOutput::VideoDetails(batch)
    }
}

impl LookupItem for ChannelDetails {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(ids: ResourceIds) -> JobParams {
        JobParams::ChannelDetails(ids)
    }

    fn from_output(output: JobOutput) -> Option<ResourceBatch<Self>> {
        match output {
            JobOutput::ChannelDetails(batch) => Some(batch),
            _ => None,
        }
    }

    fn into_output(batch: ResourceBatch<Self>) -> JobOutput {
        JobOutput::ChannelDetails(batch)
    }
}

impl LookupItem for VideoStats {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(ids: ResourceIds) -> JobParams {
        JobParams::VideoStats(ids)
    }

    fn from_output(output: JobOutput) -> Option<ResourceBatch<Self>> {
        match output {
            JobOutput::VideoStats(batch) => Some(batch),
            _ => None,
        }
    }

    fn into_output(batch: ResourceBatch<Self>) -> JobOutput {
        JobOutput::VideoStats(batch)
    }
}

/// Executes claims on behalf of the worker pool.
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    ledger: Arc<QuotaLedger>,
    cache: Arc<RequestCache>,
    client: VideoApiClient,
    tokens: Arc<OAuthTokenManager>,
    vault: Arc<dyn CredentialVault>,
    default_api_key: Option<String>,
    ttl: CacheTtlPolicy,
    events: EventBus,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueue>,
        ledger: Arc<QuotaLedger>,
        cache: Arc<RequestCache>,
        client: VideoApiClient,
        tokens: Arc<OAuthTokenManager>,
        vault: Arc<dyn CredentialVault>,
        default_api_key: Option<String>,
        ttl: CacheTtlPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            ledger,
            cache,
            client,
            tokens,
            vault,
            default_api_key,
            ttl,
            events,
        }
    }

    /// Resolve every job in `claim`, successfully or not.
    #[tracing::instrument(
        skip_all,
        fields(operation = %claim.operation_type, jobs = claim.jobs.len())
    )]
    pub async fn run(&self, claim: Claim) {
        match claim.operation_type {
            OperationType::VideoDetails => self.run_lookup::<VideoDetails>(claim).await,
            OperationType::ChannelDetails => self.run_lookup::<ChannelDetails>(claim).await,
            OperationType::VideoStats => self.run_lookup::<VideoStats>(claim).await,
            OperationType::Search | OperationType::PlaylistItems => {
                for job in claim.jobs {
                    self.run_single(job).await;
                }
            }
        }
    }

    async fn run_single(&self, job: ClaimedJob) {
        let operation = job.params.operation_type();
        let cache_key = job.params.cache_key();

        if let Some(key) = &cache_key {
            if let Some(output) = self.cache.get_json::<JobOutput>(key).await {
                tracing::debug!(job_id = %job.id, key = %key, "served from cache");
                self.queue.complete(job.id, output, true);
                return;
            }
        }

        let cost = self.client.quota_cost(operation, job.params.resource_count());
        let Some(reservation) = self.reserve(&[&job], cost) else {
            return;
        };

        match self.call_upstream(job.owner_id.as_deref(), &job.params).await {
            Ok(output) => {
                if let Some(key) = &cache_key {
                    self.cache
                        .set_json(key, &output, self.ttl.ttl_for(operation))
                        .await;
                }
                self.commit(reservation);
                self.queue.complete(job.id, output, false);
            }
            Err(error) => {
                drop(reservation);
                self.queue.fail_attempt(job.id, error);
            }
        }
    }

    /// Batched lookup: cached ids are served per id, the rest are fetched
    /// in one upstream call for every job in the claim.
    async fn run_lookup<T: LookupItem>(&self, claim: Claim) {
        let operation = claim.operation_type;
        let ttl = self.ttl.ttl_for(operation);

        let mut union = Vec::new();
        let mut seen = HashSet::new();
        let requested = claim
            .jobs
            .iter()
            .filter_map(|job| job.params.resource_ids())
            .flat_map(ResourceIds::iter);
        for id in requested {
            if seen.insert(id) {
                union.push(id.to_owned());
            }
        }

        let mut resolved: HashMap<String, Option<T>> = HashMap::with_capacity(union.len());
        for id in &union {
            let key = resource_cache_key(operation, id);
            if let Some(entry) = self.cache.get_json::<Option<T>>(&key).await {
                resolved.insert(id.clone(), entry);
            }
        }

        let to_fetch: Vec<String> = union
            .iter()
            .filter(|id| !resolved.contains_key(*id))
            .cloned()
            .collect();
        let cache_hit = to_fetch.is_empty();

        if !to_fetch.is_empty() {
            let jobs: Vec<&ClaimedJob> = claim.jobs.iter().collect();
            let cost = self.client.quota_cost(operation, to_fetch.len());
            let Some(reservation) = self.reserve(&jobs, cost) else {
                return;
            };

            let fetched = match ResourceIds::new(to_fetch) {
                Ok(ids) => {
                    let owner = claim.jobs.first().and_then(|job| job.owner_id.as_deref());
                    self.call_upstream(owner, &T::params(ids))
                        .await
                        .and_then(|output| {
                            T::from_output(output).ok_or_else(|| {
                                ApiError::internal(format!(
                                    "upstream returned the wrong shape for {operation}"
                                ))
                            })
                        })
                }
                Err(error) => Err(ApiError::from(error)),
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(error) => {
                    drop(reservation);
                    for job in &claim.jobs {
                        self.queue.fail_attempt(job.id, error.clone());
                    }
                    return;
                }
            };

            for item in batch.items {
                let key = resource_cache_key(operation, item.id());
                let entry = Some(item);
                self.cache.set_json(&key, &entry, ttl).await;
                if let Some(item) = entry {
                    resolved.insert(item.id().to_owned(), Some(item));
                }
            }
            // Known-missing ids are cached too, so they are not asked for again.
            for id in batch.missing {
                let key = resource_cache_key(operation, &id);
                self.cache.set_json(&key, &None::<T>, ttl).await;
                resolved.insert(id, None);
            }
            self.commit(reservation);
        }

        for job in claim.jobs {
            let mut batch = ResourceBatch {
                items: Vec::new(),
                missing: Vec::new(),
            };
            for id in job.params.resource_ids().into_iter().flat_map(ResourceIds::iter) {
                match resolved.get(id) {
                    Some(Some(item)) => batch.items.push(item.clone()),
                    _ => batch.missing.push(id.to_owned()),
                }
            }
            self.queue.complete(job.id, T::into_output(batch), cache_hit);
        }
    }

    /// Hold quota for the call; on exhaustion the jobs fail without retry.
    fn reserve(&self, jobs: &[&ClaimedJob], cost: u64) -> Option<QuotaReservation> {
        match self.ledger.reserve(cost) {
            Ok(reservation) => Some(reservation),
            Err(error) => {
                let error = error.to_api_error(UtcDateTime::now());
                for job in jobs {
                    self.queue.fail_attempt(job.id, error.clone());
                }
                None
            }
        }
    }

    fn commit(&self, reservation: QuotaReservation) {
        let units = reservation.units();
        match reservation.commit() {
            Ok(snapshot) => self.events.publish(GatewayEvent::QuotaCommitted {
                units,
                used: snapshot.used,
                remaining: snapshot.remaining,
            }),
            // The call already succeeded; its result is still delivered.
            Err(error) => {
                tracing::error!(%error, units, "failed to commit quota after upstream success");
            }
        }
    }

    /// Pick credentials for `owner` and make the call: the owner's OAuth
    /// credential, then the owner's API key, then the default key.
    async fn call_upstream(
        &self,
        owner: Option<&str>,
        params: &JobParams,
    ) -> Result<JobOutput, ApiError> {
        if let Some(owner) = owner {
            if let Some(credential) = self.vault.oauth_credential(owner).await? {
                let observer =
                    VaultRefreshObserver::new(Arc::clone(&self.vault), owner, self.events.clone());
                let client = &self.client;
                let authorized = self
                    .tokens
                    .with_auto_refresh(credential, &observer, |access_token| {
                        let auth = ClientAuth::Bearer(access_token);
                        async move { client.call(params, &auth).await }
                    })
                    .await?;
                return Ok(authorized.value);
            }
            if let Some(key) = self.vault.api_key_for_owner(owner).await? {
                return self.client.call(params, &ClientAuth::ApiKey(key)).await;
            }
        }

        match &self.default_api_key {
            Some(key) => self.client.call(params, &ClientAuth::ApiKey(key.clone())).await,
            None => Err(ApiError::auth_expired(match owner {
                Some(owner) => {
                    format!("no credential available for owner {owner}; re-consent required")
                }
                None => String::from("no API key configured; re-consent required"),
            })),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("client", &self.client)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
