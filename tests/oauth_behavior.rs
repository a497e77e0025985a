//! Behavior-driven tests for OAuth credential handling
//!
//! These tests verify HOW jobs running under an owner's OAuth credential
//! recover from expired or rejected access tokens, and when they give up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vidgate_core::{
    CredentialVault, GatewayBuilder, GatewayConfig, GatewayEvent, HttpResponse, InMemoryVault,
    JobParams, JobRequest, JobStatus, MockHttpClient, NoopRefreshObserver, OAuthCredential,
    OAuthTokenManager, RefreshFuture, RefreshedToken, SearchParams, TokenRefresher, UtcDateTime,
};

/// Issues `fresh-<n>` access tokens and counts how often it was asked.
struct CountingRefresher {
    calls: AtomicUsize,
    latency: Duration,
}

impl CountingRefresher {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            latency,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenRefresher for CountingRefresher {
    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.latency).await;
            Ok(RefreshedToken {
                access_token: format!("fresh-{call}"),
                expires_in_secs: 3_600,
                refresh_token: None,
                scope: None,
            })
        })
    }
}

fn credential(access_token: &str, expires_in: time::Duration) -> OAuthCredential {
    OAuthCredential {
        access_token: access_token.to_owned(),
        refresh_token: Some(String::from("refresh-1")),
        expires_at: UtcDateTime::now().saturating_add(expires_in),
        scope: String::from("youtube.readonly"),
    }
}

/// Accepts only access tokens issued by [`CountingRefresher`].
fn fresh_only_mock() -> MockHttpClient {
    MockHttpClient::new(|request| {
        let authorized = request
            .headers
            .get("authorization")
            .is_some_and(|value| value.starts_with("Bearer fresh-"));
        if authorized {
            Ok(HttpResponse::ok_json(r#"{"items":[]}"#))
        } else {
            Ok(HttpResponse::new(
                401,
                r#"{"error":{"message":"Invalid Credentials","errors":[{"reason":"authError"}]}}"#,
            ))
        }
    })
}

fn owned_search() -> JobRequest {
    JobRequest::new(JobParams::Search(SearchParams::new("rust"))).with_owner("acme")
}

// =============================================================================
// OAuth: Refresh
// =============================================================================

#[tokio::test]
async fn when_access_token_is_rejected_it_is_refreshed_once_and_call_retried() {
    // Given: An owner whose stored access token the provider no longer accepts
    let http = fresh_only_mock();
    let refresher = CountingRefresher::new(Duration::ZERO);
    let vault = InMemoryVault::new()
        .with_oauth_credential("acme", credential("stale", time::Duration::hours(1)));
    let gateway = GatewayBuilder::new(GatewayConfig::default())
        .with_http_client(Arc::new(http.clone()))
        .with_token_refresher(refresher.clone())
        .with_vault(Arc::new(vault.clone()))
        .build()
        .expect("gateway");
    let mut events = gateway.subscribe();
    gateway.start();

    // When: A job runs under that owner
    let job = gateway
        .enqueue(owned_search())
        .expect("enqueue")
        .wait_snapshot()
        .await;

    // Then: One refresh, one retry, success; the new credential was stored
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(refresher.calls(), 1);
    assert_eq!(http.call_count(), 2);
    assert_eq!(vault.persisted_count(), 1);

    let stored = vault
        .oauth_credential("acme")
        .await
        .expect("vault")
        .expect("credential");
    assert_eq!(stored.access_token, "fresh-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));

    let mut announced = false;
    while let Ok(event) = events.try_recv() {
        announced |= event
            == GatewayEvent::CredentialRefreshed {
                owner_id: Some(String::from("acme")),
            };
    }
    assert!(announced);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_refreshed_token_is_rejected_too_job_fails_as_expired() {
    // Given: A provider that rejects every token
    let http = MockHttpClient::always(401, r#"{"error":{"message":"Invalid Credentials"}}"#);
    let refresher = CountingRefresher::new(Duration::ZERO);
    let vault = InMemoryVault::new()
        .with_oauth_credential("acme", credential("stale", time::Duration::hours(1)));
    let gateway = GatewayBuilder::new(GatewayConfig::default().with_api_key("fallback-key"))
        .with_http_client(Arc::new(http.clone()))
        .with_token_refresher(refresher.clone())
        .with_vault(Arc::new(vault))
        .build()
        .expect("gateway");
    gateway.start();

    // When: A job runs under the owner
    let job = gateway
        .enqueue(owned_search())
        .expect("enqueue")
        .wait_snapshot()
        .await;

    // Then: Exactly one refresh, then the job fails without job-level retries
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.expect("error").code, "auth.expired");
    assert_eq!(refresher.calls(), 1);
    assert_eq!(http.call_count(), 2);
    assert_eq!(gateway.quota().used, 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_credential_is_already_expired_it_is_refreshed_before_the_call() {
    let http = fresh_only_mock();
    let refresher = CountingRefresher::new(Duration::ZERO);
    let vault = InMemoryVault::new()
        .with_oauth_credential("acme", credential("stale", time::Duration::minutes(-1)));
    let gateway = GatewayBuilder::new(GatewayConfig::default())
        .with_http_client(Arc::new(http.clone()))
        .with_token_refresher(refresher.clone())
        .with_vault(Arc::new(vault))
        .build()
        .expect("gateway");
    gateway.start();

    let job = gateway
        .enqueue(owned_search())
        .expect("enqueue")
        .wait_snapshot()
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(refresher.calls(), 1);
    assert_eq!(http.call_count(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_refresh_is_not_configured_rejected_token_needs_consent() {
    let http = MockHttpClient::always(401, r#"{"error":{"message":"Invalid Credentials"}}"#);
    let vault = InMemoryVault::new()
        .with_oauth_credential("acme", credential("stale", time::Duration::hours(1)));
    let gateway = GatewayBuilder::new(GatewayConfig::default())
        .with_http_client(Arc::new(http.clone()))
        .with_vault(Arc::new(vault))
        .build()
        .expect("gateway");
    gateway.start();

    let error = gateway
        .enqueue(owned_search())
        .expect("enqueue")
        .wait()
        .await
        .expect_err("no refresher");

    assert_eq!(error.code, "auth.expired");
    assert!(error.message.contains("re-consent"));
    assert_eq!(http.call_count(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_two_callers_refresh_the_same_token_only_one_refresh_happens() {
    let refresher = CountingRefresher::new(Duration::from_millis(50));
    let manager = OAuthTokenManager::new(refresher.clone());
    let stale = credential("stale", time::Duration::minutes(-1));

    let (first, second) = tokio::join!(manager.refresh(&stale), manager.refresh(&stale));

    let first = first.expect("first refresh");
    let second = second.expect("second refresh");
    assert_eq!(refresher.calls(), 1);
    assert_eq!(first.access_token, second.access_token);
}

#[tokio::test]
async fn when_token_is_valid_no_refresh_is_attempted() {
    let refresher = CountingRefresher::new(Duration::ZERO);
    let manager = OAuthTokenManager::new(refresher.clone());

    let authorized = manager
        .with_auto_refresh(
            credential("fresh-0", time::Duration::hours(1)),
            &NoopRefreshObserver,
            |token| async move { Ok::<_, vidgate_core::ApiError>(token) },
        )
        .await
        .expect("authorized");

    assert_eq!(authorized.value, "fresh-0");
    assert!(!authorized.refreshed);
    assert_eq!(refresher.calls(), 0);
}

// =============================================================================
// Credentials: Selection
// =============================================================================

#[tokio::test]
async fn when_owner_has_an_api_key_it_is_used_instead_of_the_default() {
    let http = MockHttpClient::always(200, r#"{"items":[]}"#);
    let vault = InMemoryVault::new().with_api_key("acme", "owner-key");
    let gateway = GatewayBuilder::new(GatewayConfig::default().with_api_key("default-key"))
        .with_http_client(Arc::new(http.clone()))
        .with_vault(Arc::new(vault))
        .build()
        .expect("gateway");
    gateway.start();

    gateway
        .enqueue(owned_search())
        .expect("enqueue")
        .wait()
        .await
        .expect("search");
    gateway
        .enqueue(JobRequest::new(JobParams::Search(SearchParams::new("other"))))
        .expect("enqueue")
        .wait()
        .await
        .expect("search");

    let keys: Vec<String> = http
        .requests()
        .iter()
        .filter_map(|request| request.query_param("key").map(str::to_owned))
        .collect();
    assert_eq!(keys, ["owner-key", "default-key"]);

    gateway.shutdown().await;
}
