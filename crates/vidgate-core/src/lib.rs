//! # Vidgate Core
//!
//! Quota-governed access to a video-platform data API.
//!
//! ## Overview
//!
//! Callers submit jobs (search, video/channel lookups, playlist pages,
//! statistics) and poll or await their outcome. Between the caller and the
//! provider sit:
//!
//! - **A daily quota ledger** that refuses work the remaining budget cannot
//!   cover and only spends units on upstream success
//! - **A two-tier cache** (in-process LRU plus an optional shared Redis tier)
//! - **Per-operation priority queues** drained by a rate-limited worker pool
//! - **An OAuth token lifecycle** that refreshes expired or rejected tokens once
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Local and shared cache tiers and the `RequestCache` facade |
//! | [`client`] | Video API client and response normalization |
//! | [`config`] | Environment-driven gateway configuration |
//! | [`credentials`] | Credential vault contract and in-memory vault |
//! | [`domain`] | Operation types, job parameters and normalized models |
//! | [`error`] | Caller-visible error types |
//! | [`events`] | Broadcast of gateway lifecycle events |
//! | [`gateway`] | The `Gateway` context and its builder |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`oauth`] | OAuth credential refresh |
//! | [`quota`] | Daily quota ledger and its persistence |
//! | [`retry`] | Job retry policy |
//! | [`scheduler`] | Job queues, worker pool and dispatcher |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Caller / CLI   │
//! └────────┬────────┘
//!          │ enqueue
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │    JobQueue     │────▶│   QuotaLedger    │
//! └────────┬────────┘     └──────────────────┘
//!          │ claim
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   WorkerPool    │────▶│   RequestCache   │
//! │   Dispatcher    │     └──────────────────┘
//! └────────┬────────┘
//!          │                ┌──────────────────┐
//!          ▼                │ OAuthTokenManager│
//! ┌─────────────────┐◀──────┴──────────────────┘
//! │ VideoApiClient  │────▶ HTTP client
//! └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vidgate_core::{GatewayBuilder, JobParams, JobRequest, SearchParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = GatewayBuilder::from_env()?.build()?;
//!     gateway.start();
//!
//!     let search = JobParams::Search(SearchParams::new("rust"));
//!     let handle = gateway.enqueue(JobRequest::new(search))?;
//!     match handle.wait().await {
//!         Ok(output) => println!("{} results", output.item_count()),
//!         Err(error) => eprintln!("{}: {}", error.code, error.message),
//!     }
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security
//!
//! - API keys and tokens are redacted from `Debug` output and never logged
//! - Error reports carry the provider's message, never its raw body

pub mod cache;
pub mod client;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http_client;
pub mod oauth;
pub mod quota;
pub mod retry;
pub mod scheduler;

// Caching
pub use cache::{
    CacheStats, CacheTtlPolicy, InMemorySharedTier, LocalTier, RedisSharedTier, RequestCache,
    SharedTier,
};

// Upstream client
pub use client::{ClientAuth, VideoApiClient};

// Configuration
pub use config::{ConfigError, GatewayConfig, OAuthClientConfig};

// Credentials
pub use credentials::{
    CredentialVault, InMemoryVault, VaultError, VaultFuture, VaultRefreshObserver,
};

// Domain models
pub use domain::{
    ChannelDetails, JobOutput, JobParams, OperationType, Page, PlaylistItem, PlaylistPage,
    Priority, ResourceBatch, ResourceIds, ResourceKind, SearchHit, SearchOrder, SearchParams,
    UtcDateTime, VideoDetails, VideoStatistics, VideoStats,
};

// Errors
pub use error::{ApiError, ApiErrorKind, ErrorReport, ValidationError};

// Events
pub use events::{EventBus, GatewayEvent};

// Gateway
pub use gateway::{Gateway, GatewayBuilder, GatewayError};

// Transport
pub use http_client::{
    HttpClient, HttpError, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient,
};

// OAuth
pub use oauth::{
    Authorized, DisabledTokenRefresher, HttpTokenRefresher, NoopRefreshObserver, OAuthCredential,
    OAuthTokenManager, RefreshError, RefreshFuture, RefreshObserver, RefreshedToken,
    TokenRefresher,
};

// Quota
pub use quota::{
    DailyReset, InMemoryQuotaStore, PersistentQuotaStore, QuotaCostTable, QuotaError, QuotaLedger,
    QuotaSnapshot, QuotaState, QuotaStore,
};

// Retry
pub use retry::{Backoff, RetryPolicy};

// Scheduling
pub use scheduler::{
    JobHandle, JobId, JobRequest, JobSnapshot, JobStatus, QueuePolicies, QueuePolicy, QueueStats,
    RetentionPolicy,
};
