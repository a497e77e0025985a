//! Authenticated calls to the video-platform data API.
//!
//! The client builds requests, charges nothing itself (see
//! [`VideoApiClient::quota_cost`]), classifies provider failures into
//! [`ApiError`]s and normalizes responses into domain types.

mod normalize;
mod wire;

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::domain::{
    ChannelDetails, JobOutput, JobParams, OperationType, Page, PlaylistItem, PlaylistPage,
    ResourceBatch, SearchHit, SearchParams, VideoDetails, VideoStats, MAX_PAGE_SIZE,
};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::quota::QuotaCostTable;
use crate::ApiError;

use wire::{ErrorEnvelope, ListResponse, PlaylistItemResource, SearchItem};

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Largest number of ids the provider accepts in one lookup.
pub const PROVIDER_CHUNK_SIZE: usize = MAX_PAGE_SIZE as usize;

/// How a request authenticates.
///
/// The mode is passed with each call instead of being fixed when the client
/// is built: one [`VideoApiClient`] serves every owner, and each owner brings
/// its own credential. [`ClientAuth::select`] applies the bearer-over-key
/// precedence when a caller holds both.
#[derive(Clone, PartialEq, Eq)]
pub enum ClientAuth {
    /// `?key=...`
    ApiKey(String),
    /// `Authorization: Bearer ...`
    Bearer(String),
}

impl ClientAuth {
    /// Bearer wins when both are available.
    pub fn select(api_key: Option<String>, bearer_token: Option<String>) -> Option<Self> {
        bearer_token
            .map(Self::Bearer)
            .or_else(|| api_key.map(Self::ApiKey))
    }

    fn http_auth(&self) -> HttpAuth {
        match self {
            Self::ApiKey(key) => HttpAuth::QueryKey {
                name: String::from("key"),
                value: key.clone(),
            },
            Self::Bearer(token) => HttpAuth::BearerToken(token.clone()),
        }
    }
}

impl Debug for ClientAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

#[derive(Clone)]
pub struct VideoApiClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    timeout: Duration,
    costs: QuotaCostTable,
}

impl VideoApiClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout: Duration::from_secs(10),
            costs: QuotaCostTable::default(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cost_table(mut self, costs: QuotaCostTable) -> Self {
        self.costs = costs;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn quota_cost(&self, operation: OperationType, resource_count: usize) -> u64 {
        self.costs.cost(operation, resource_count)
    }

    /// Run one job's worth of upstream work.
    #[tracing::instrument(skip(self, params, auth), fields(operation = %params.operation_type()))]
    pub async fn call(&self, params: &JobParams, auth: &ClientAuth) -> Result<JobOutput, ApiError> {
        match params {
            JobParams::Search(search) => self.search(search, auth).await.map(JobOutput::Search),
            JobParams::VideoDetails(ids) => self
                .videos(ids.as_slice(), auth)
                .await
                .map(JobOutput::VideoDetails),
            JobParams::ChannelDetails(ids) => self
                .channels(ids.as_slice(), auth)
                .await
                .map(JobOutput::ChannelDetails),
            JobParams::PlaylistItems(page) => self
                .playlist_items(page, auth)
                .await
                .map(JobOutput::PlaylistItems),
            JobParams::VideoStats(ids) => self
                .video_stats(ids.as_slice(), auth)
                .await
                .map(JobOutput::VideoStats),
        }
    }

    pub async fn search(
        &self,
        params: &SearchParams,
        auth: &ClientAuth,
    ) -> Result<Page<SearchHit>, ApiError> {
        let mut query = vec![
            ("part", String::from("snippet")),
            ("q", params.normalized_query()),
            ("maxResults", params.max_results.to_string()),
        ];
        if let Some(order) = params.order {
            query.push(("order", order.as_str().to_owned()));
        }
        if let Some(channel_id) = &params.channel_id {
            query.push(("channelId", channel_id.trim().to_owned()));
        }
        if let Some(published_after) = params.published_after {
            query.push(("publishedAfter", published_after.format_rfc3339()));
        }
        if let Some(kind) = params.resource_kind {
            query.push(("type", kind.as_str().to_owned()));
        }

        let response: ListResponse<SearchItem> = self.get("search", &query, auth).await?;
        let total_results = response.total_results();
        Ok(Page {
            items: response
                .items
                .into_iter()
                .filter_map(normalize::search_hit)
                .collect(),
            next_page_token: response.next_page_token,
            total_results,
        })
    }

    pub async fn videos(
        &self,
        ids: &[String],
        auth: &ClientAuth,
    ) -> Result<ResourceBatch<VideoDetails>, ApiError> {
        self.lookup(
            "videos",
            "snippet,contentDetails,statistics",
            ids,
            auth,
            normalize::video_details,
            |video| &video.id,
        )
        .await
    }

    pub async fn channels(
        &self,
        ids: &[String],
        auth: &ClientAuth,
    ) -> Result<ResourceBatch<ChannelDetails>, ApiError> {
        self.lookup(
            "channels",
            "snippet,statistics,contentDetails",
            ids,
            auth,
            normalize::channel_details,
            |channel| &channel.id,
        )
        .await
    }

    pub async fn video_stats(
        &self,
        ids: &[String],
        auth: &ClientAuth,
    ) -> Result<ResourceBatch<VideoStats>, ApiError> {
        self.lookup(
            "videos",
            "statistics",
            ids,
            auth,
            normalize::video_stats,
            |stats| &stats.id,
        )
        .await
    }

    pub async fn playlist_items(
        &self,
        page: &PlaylistPage,
        auth: &ClientAuth,
    ) -> Result<Page<PlaylistItem>, ApiError> {
        let mut query = vec![
            ("part", String::from("snippet,contentDetails")),
            ("playlistId", page.playlist_id.trim().to_owned()),
            ("maxResults", page.max_results.to_string()),
        ];
        if let Some(token) = &page.page_token {
            query.push(("pageToken", token.clone()));
        }

        let response: ListResponse<PlaylistItemResource> =
            self.get("playlistItems", &query, auth).await?;
        let total_results = response.total_results();
        Ok(Page {
            items: response
                .items
                .into_iter()
                .filter_map(normalize::playlist_item)
                .collect(),
            next_page_token: response.next_page_token,
            total_results,
        })
    }

    /// Fetch ids in provider-sized chunks and return them in request order.
    async fn lookup<R, T>(
        &self,
        path: &str,
        part: &str,
        ids: &[String],
        auth: &ClientAuth,
        convert: impl Fn(R) -> T,
        id_of: impl Fn(&T) -> &String,
    ) -> Result<ResourceBatch<T>, ApiError>
    where
        R: DeserializeOwned,
    {
        let mut found: HashMap<String, T> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(PROVIDER_CHUNK_SIZE) {
            let query = [
                ("part", part.to_owned()),
                ("id", chunk.join(",")),
                ("maxResults", chunk.len().to_string()),
            ];
            let response: ListResponse<R> = self.get(path, &query, auth).await?;
            for item in response.items.into_iter().map(&convert) {
                found.insert(id_of(&item).clone(), item);
            }
        }

        let mut batch = ResourceBatch {
            items: Vec::with_capacity(found.len()),
            missing: Vec::new(),
        };
        for id in ids {
            match found.remove(id) {
                Some(item) => batch.items.push(item),
                None => batch.missing.push(id.clone()),
            }
        }
        Ok(batch)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        auth: &ClientAuth,
    ) -> Result<T, ApiError> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let request = query
            .iter()
            .fold(HttpRequest::get(format!("{}/{path}", self.base_url)), |request, (name, value)| {
                request.with_query(*name, value.clone())
            })
            .with_auth(&auth.http_auth())
            .with_timeout_ms(timeout_ms);

        let response = match tokio::time::timeout(self.timeout, self.http.execute(request)).await {
            Err(_) => {
                return Err(ApiError::timeout(format!(
                    "{path} request timed out after {timeout_ms}ms"
                )))
            }
            Ok(Err(error)) if error.is_timeout() => {
                return Err(ApiError::timeout(format!(
                    "{path} request timed out: {}",
                    error.message()
                )))
            }
            Ok(Err(error)) => {
                return Err(ApiError::transport(format!(
                    "{path} request failed: {}",
                    error.message()
                )))
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            let error = classify_error(response.status, &response.body);
            tracing::debug!(
                path,
                status = response.status,
                code = error.code(),
                "provider rejected request"
            );
            return Err(error);
        }

        serde_json::from_str(&response.body)
            .map_err(|e| ApiError::internal(format!("failed to parse {path} response: {e}")))
    }
}

impl Debug for VideoApiClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoApiClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Map a non-success provider response to an [`ApiError`], keeping the
/// provider's status and message.
pub fn classify_error(status: u16, body: &str) -> ApiError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let reason = envelope
        .as_ref()
        .and_then(|e| e.error.errors.iter().find_map(|detail| detail.reason.clone()));
    let message = envelope
        .map(|e| e.error.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("provider returned status {status}"));
    let message = match &reason {
        Some(reason) => format!("{message} ({reason})"),
        None => message,
    };

    match (status, reason.as_deref()) {
        (401, _) => ApiError::unauthorized(message),
        (403, Some("quotaExceeded" | "dailyLimitExceeded")) => {
            ApiError::quota_exceeded(message).with_status(403)
        }
        (403, Some("rateLimitExceeded" | "userRateLimitExceeded")) => {
            ApiError::upstream(403, message).with_retryable(true)
        }
        _ => ApiError::upstream(status, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ResourceIds, SearchOrder};
    use crate::http_client::{HttpError, HttpResponse, MockHttpClient};
    use crate::ApiErrorKind;

    fn client(http: &MockHttpClient) -> VideoApiClient {
        VideoApiClient::new(Arc::new(http.clone()), "https://api.example.test/v3/")
    }

    fn key() -> ClientAuth {
        ClientAuth::ApiKey(String::from("k-123"))
    }

    #[test]
    fn bearer_is_preferred_over_api_key() {
        assert_eq!(
            ClientAuth::select(Some(String::from("k")), Some(String::from("t"))),
            Some(ClientAuth::Bearer(String::from("t")))
        );
        assert_eq!(
            ClientAuth::select(Some(String::from("k")), None),
            Some(ClientAuth::ApiKey(String::from("k")))
        );
        assert_eq!(ClientAuth::select(None, None), None);
    }

    #[test]
    fn quota_cost_follows_the_cost_table() {
        let client = client(&MockHttpClient::always(200, "{}"));
        assert_eq!(client.quota_cost(OperationType::Search, 1), 100);
        assert_eq!(client.quota_cost(OperationType::VideoDetails, 3), 3);
        assert_eq!(client.quota_cost(OperationType::PlaylistItems, 1), 1);
    }

    #[tokio::test]
    async fn search_sends_filters_and_api_key() {
        let http = MockHttpClient::always(
            200,
            r#"{"items":[{"id":{"kind":"youtube#video","videoId":"v1"},"snippet":{"title":"One"}}],
                "nextPageToken":"NEXT","pageInfo":{"totalResults":42}}"#,
        );
        let params = SearchParams::new("  Rust  Async ")
            .with_max_results(10)
            .with_order(SearchOrder::ViewCount);

        let page = client(&http).search(&params, &key()).await.expect("search");

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("NEXT"));
        assert_eq!(page.total_results, Some(42));

        let requests = http.requests();
        let request = &requests[0];
        assert_eq!(request.url, "https://api.example.test/v3/search");
        assert_eq!(request.query_param("key"), Some("k-123"));
        assert_eq!(request.query_param("maxResults"), Some("10"));
        assert_eq!(request.query_param("order"), Some("viewCount"));
        assert!(!request.headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn bearer_auth_uses_authorization_header() {
        let http = MockHttpClient::always(200, r#"{"items":[]}"#);
        let auth = ClientAuth::Bearer(String::from("tok"));
        client(&http)
            .playlist_items(&PlaylistPage::new("PL1").with_page_token("P2"), &auth)
            .await
            .expect("page");

        let requests = http.requests();
        let request = &requests[0];
        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer tok")
        );
        assert_eq!(request.query_param("key"), None);
        assert_eq!(request.query_param("pageToken"), Some("P2"));
    }

    #[tokio::test]
    async fn lookups_are_chunked_and_returned_in_request_order() {
        let http = MockHttpClient::new(|request| {
            let ids = request.query_param("id").unwrap_or_default();
            let items: Vec<String> = ids
                .split(',')
                .filter(|id| *id != "gone")
                .map(|id| format!(r#"{{"id":"{id}","statistics":{{"viewCount":"5"}}}}"#))
                .collect();
            Ok(HttpResponse::ok_json(format!(r#"{{"items":[{}]}}"#, items.join(","))))
        });
        let mut ids: Vec<String> = (0..60).map(|n| format!("v{n}")).collect();
        ids.insert(3, String::from("gone"));
        let ids = ResourceIds::new(ids).expect("ids");

        let batch = client(&http)
            .video_stats(ids.as_slice(), &key())
            .await
            .expect("stats");

        assert_eq!(http.call_count(), 2);
        assert_eq!(batch.items.len(), 60);
        assert_eq!(batch.items[0].id, "v0");
        assert_eq!(batch.items[3].id, "v3");
        assert_eq!(batch.missing, vec![String::from("gone")]);
    }

    #[test]
    fn provider_errors_keep_status_and_message() {
        let body = r#"{"error":{"code":400,"message":"Invalid value for order",
            "errors":[{"reason":"invalidParameter"}]}}"#;
        let error = classify_error(400, body);
        assert_eq!(error.kind(), ApiErrorKind::Upstream);
        assert_eq!(error.status(), Some(400));
        assert!(error.message().contains("Invalid value for order"));
        assert!(!error.retryable());

        assert!(classify_error(503, "").retryable());
        assert_eq!(classify_error(401, "").kind(), ApiErrorKind::Unauthorized);
    }

    #[test]
    fn quota_and_rate_limit_rejections_are_distinguished() {
        let quota = classify_error(
            403,
            r#"{"error":{"message":"quota","errors":[{"reason":"quotaExceeded"}]}}"#,
        );
        assert_eq!(quota.kind(), ApiErrorKind::QuotaExceeded);
        assert!(!quota.retryable());

        let rate = classify_error(
            403,
            r#"{"error":{"message":"slow down","errors":[{"reason":"rateLimitExceeded"}]}}"#,
        );
        assert_eq!(rate.kind(), ApiErrorKind::Upstream);
        assert!(rate.retryable());
    }

    #[tokio::test]
    async fn transport_failures_are_retryable() {
        let http = MockHttpClient::new(|_| Err(HttpError::timeout("deadline elapsed")));
        let error = client(&http)
            .videos(&[String::from("a")], &key())
            .await
            .expect_err("timeout");
        assert_eq!(error.kind(), ApiErrorKind::Timeout);
        assert!(error.retryable());

        let slow =
            MockHttpClient::always(200, r#"{"items":[]}"#).with_latency(Duration::from_millis(200));
        let error = client(&slow)
            .with_timeout(Duration::from_millis(20))
            .videos(&[String::from("a")], &key())
            .await
            .expect_err("timeout");
        assert_eq!(error.code(), "upstream.timeout");
    }
}
