//! Behavior-driven tests for daily quota accounting
//!
//! These tests verify HOW the gateway spends its daily unit budget: what it
//! refuses up front, what it charges for, and what it never charges for.

use std::sync::Arc;
use std::time::Duration;

use vidgate_core::{
    ApiErrorKind, DailyReset, GatewayBuilder, GatewayConfig, JobParams, JobRequest, JobStatus,
    MockHttpClient, PersistentQuotaStore, QuotaLedger, ResourceIds, RetryPolicy, SearchParams,
};
use vidgate_store::{LedgerStore, StoreConfig};
use vidgate_tests::lookup_mock;

fn search_body() -> &'static str {
    r#"{"items":[{"id":{"kind":"youtube#video","videoId":"v1"},"snippet":{"title":"One"}}]}"#
}

fn stats_mock() -> MockHttpClient {
    lookup_mock(|id| Some(format!(r#"{{"id":"{id}","statistics":{{"viewCount":"7"}}}}"#)))
}

fn gateway_with(http: &MockHttpClient, daily_quota: u64) -> vidgate_core::Gateway {
    GatewayBuilder::new(
        GatewayConfig::default()
            .with_api_key("test-key")
            .with_daily_quota(daily_quota),
    )
    .with_http_client(Arc::new(http.clone()))
    .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10), 3))
    .build()
    .expect("gateway should build")
}

fn stats_request(ids: &[&str]) -> JobRequest {
    JobRequest::new(JobParams::VideoStats(ResourceIds::new(ids.iter().copied()).expect("ids")))
}

// =============================================================================
// Quota: Admission
// =============================================================================

#[tokio::test]
async fn when_search_costs_more_than_remaining_quota_job_is_rejected_without_upstream_call() {
    // Given: 50 units left and a search that costs 100
    let http = MockHttpClient::always(200, search_body());
    let gateway = gateway_with(&http, 50);
    gateway.start();

    // When: The search is submitted
    let error = gateway
        .enqueue(JobRequest::new(JobParams::Search(SearchParams::new("rust"))))
        .expect_err("search should be refused");

    // Then: It is refused as quota exhaustion, nothing is queued or fetched
    assert_eq!(error.kind(), ApiErrorKind::QuotaExceeded);
    assert_eq!(error.code(), "quota.exceeded");
    assert!(!error.retryable());
    assert!(gateway.queue_stats().iter().all(|stats| stats.waiting == 0 && stats.delayed == 0));
    assert_eq!(http.call_count(), 0);
    assert_eq!(gateway.quota().used, 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_cheap_lookup_fits_remaining_quota_it_still_runs() {
    // Given: Too little quota for a search but enough for a lookup
    let http = stats_mock();
    let gateway = gateway_with(&http, 50);
    gateway.start();

    // When: A two-id statistics lookup is submitted
    let handle = gateway.enqueue(stats_request(&["a", "b"])).expect("lookup fits");
    let job = handle.wait_snapshot().await;

    // Then: It completes and is charged one unit per id
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(gateway.quota().used, 2);

    gateway.shutdown().await;
}

// =============================================================================
// Quota: Charging
// =============================================================================

#[tokio::test]
async fn when_upstream_succeeds_quota_is_charged_exactly_once() {
    let http = MockHttpClient::always(200, search_body());
    let gateway = gateway_with(&http, 10_000);
    gateway.start();

    let handle = gateway
        .enqueue(JobRequest::new(JobParams::Search(SearchParams::new("rust"))))
        .expect("enqueue");
    handle.wait().await.expect("search should complete");

    let quota = gateway.quota();
    assert_eq!(quota.used, 100);
    assert_eq!(quota.remaining, 9_900);
    assert_eq!(quota.reserved, 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_upstream_keeps_failing_no_quota_is_spent() {
    // Given: A provider that always errors
    let http = MockHttpClient::always(503, r#"{"error":{"message":"backend unavailable"}}"#);
    let gateway = gateway_with(&http, 10_000);
    gateway.start();

    // When: A search runs out of attempts
    let handle = gateway
        .enqueue(JobRequest::new(JobParams::Search(SearchParams::new("rust"))))
        .expect("enqueue");
    let error = handle.wait().await.expect_err("search should fail");

    // Then: Every attempt went upstream, none of them was charged
    assert_eq!(error.code, "upstream.error");
    assert_eq!(http.call_count(), 3);
    assert_eq!(gateway.quota().used, 0);
    assert_eq!(gateway.quota().reserved, 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn when_result_comes_from_cache_quota_is_not_charged_again() {
    let http = MockHttpClient::always(200, search_body());
    let gateway = gateway_with(&http, 10_000);
    gateway.start();

    for _ in 0..2 {
        let handle = gateway
            .enqueue(JobRequest::new(JobParams::Search(SearchParams::new("Rust"))))
            .expect("enqueue");
        handle.wait().await.expect("search should complete");
    }

    assert_eq!(http.call_count(), 1);
    assert_eq!(gateway.quota().used, 100);

    gateway.shutdown().await;
}

// =============================================================================
// Quota: Persistence
// =============================================================================

#[test]
fn when_two_ledgers_share_a_store_each_sees_the_others_spending() {
    // Given: Two ledgers over the same persisted quota row
    let temp = tempfile::tempdir().expect("tempdir");
    let store = LedgerStore::open(StoreConfig::for_home(temp.path())).expect("store");
    let open = || {
        Arc::new(
            QuotaLedger::open(
                1_000,
                DailyReset::default(),
                Arc::new(PersistentQuotaStore::new(store.clone(), "default")),
            )
            .expect("ledger"),
        )
    };
    let first = open();
    let second = open();

    // When: Each commits spending
    first.commit(600).expect("first commit");
    second.commit(300).expect("second commit");

    // Then: Both observe the combined total and refuse what no longer fits
    assert_eq!(first.snapshot().used, 900);
    assert!(!first.has_capacity(101));
    assert!(second.has_capacity(100));
    assert!(second.commit(200).is_err());
    assert_eq!(second.snapshot().used, 900);
}

#[test]
fn when_store_is_reopened_spent_units_are_remembered() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig::for_home(temp.path());
    {
        let store = LedgerStore::open(config.clone()).expect("store");
        let ledger = QuotaLedger::open(
            1_000,
            DailyReset::default(),
            Arc::new(PersistentQuotaStore::new(store, "default")),
        )
        .expect("ledger");
        ledger.commit(250).expect("commit");
    }

    let store = LedgerStore::open(config).expect("reopen");
    let ledger = QuotaLedger::open(
        1_000,
        DailyReset::default(),
        Arc::new(PersistentQuotaStore::new(store, "default")),
    )
    .expect("ledger");
    assert_eq!(ledger.snapshot().used, 250);
}
