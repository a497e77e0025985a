//! OAuth access-token lifecycle.
//!
//! Tokens are only ever refreshed here, never minted. A call runs through a
//! small state machine:
//!
//! ```text
//! Authorized --(expired)--> Refreshing --> Authorized
//! Authorized --(401)--> Refreshing --> Authorized (one retry) --> done
//! ```
//!
//! A refresh that fails, or a credential without a refresh token, ends in
//! `auth.expired`: the owner has to consent again.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::UtcDateTime;
use crate::http_client::{HttpClient, HttpRequest};
use crate::{ApiError, ApiErrorKind};

/// Tokens expiring within this window are treated as already expired.
pub const EXPIRY_SKEW: time::Duration = time::Duration::minutes(5);

/// Access credential produced by an external consent flow.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: UtcDateTime,
    pub scope: String,
}

impl OAuthCredential {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(UtcDateTime::now())
    }

    pub fn is_expired_at(&self, now: UtcDateTime) -> bool {
        now > self.expires_at.saturating_sub(EXPIRY_SKEW)
    }

    /// Apply a refresh response. The refresh token survives unless the
    /// provider issued a new one.
    #[must_use]
    pub fn refreshed(&self, token: RefreshedToken, now: UtcDateTime) -> Self {
        let lifetime =
            time::Duration::seconds(i64::try_from(token.expires_in_secs).unwrap_or(i64::MAX));
        Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: now.saturating_add(lifetime),
            scope: token.scope.unwrap_or_else(|| self.scope.clone()),
        }
    }
}

impl Debug for OAuthCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token endpoint response.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    #[serde(rename = "expires_in", default = "default_token_lifetime")]
    pub expires_in_secs: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_lifetime() -> u64 {
    3_600
}

impl Debug for RefreshedToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("expires_in_secs", &self.expires_in_secs)
            .field("rotated_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("credential has no refresh token")]
    NoRefreshToken,
    #[error("token refresh is not configured")]
    NotConfigured,
    #[error("token endpoint rejected refresh ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
    #[error("token endpoint returned an unreadable response: {0}")]
    InvalidResponse(String),
}

impl From<RefreshError> for ApiError {
    fn from(error: RefreshError) -> Self {
        ApiError::auth_expired(format!("re-consent required: {error}"))
    }
}

pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RefreshedToken, RefreshError>> + Send + 'a>>;

/// Exchanges a refresh token for a new access token.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a>;
}

/// Refresher used when no OAuth client is configured.
#[derive(Debug, Default)]
pub struct DisabledTokenRefresher;

impl TokenRefresher for DisabledTokenRefresher {
    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(async { Err(RefreshError::NotConfigured) })
    }
}

/// Standard `grant_type=refresh_token` exchange over an [`HttpClient`].
pub struct HttpTokenRefresher {
    http: Arc<dyn HttpClient>,
    token_url: String,
    client_id: String,
    client_secret: String,
    timeout_ms: u64,
}

impl HttpTokenRefresher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            timeout_ms: 10_000,
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(async move {
            let request = HttpRequest::post(&self.token_url)
                .with_form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                ])
                .with_timeout_ms(self.timeout_ms);

            let response = self
                .http
                .execute(request)
                .await
                .map_err(|e| RefreshError::Transport(e.message().to_owned()))?;

            if !response.is_success() {
                let message = serde_json::from_str::<TokenErrorBody>(&response.body)
                    .map(|body| match body.error_description {
                        Some(description) => format!("{}: {description}", body.error),
                        None => body.error,
                    })
                    .unwrap_or_else(|_| String::from("no error detail"));
                return Err(RefreshError::Rejected {
                    status: response.status,
                    message,
                });
            }

            serde_json::from_str(&response.body)
                .map_err(|e| RefreshError::InvalidResponse(e.to_string()))
        })
    }
}

type ObserverFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Told about every credential the manager produces, before it is used.
pub trait RefreshObserver: Send + Sync {
    fn on_refresh<'a>(&'a self, credential: &'a OAuthCredential) -> ObserverFuture<'a>;
}

#[derive(Debug, Default)]
pub struct NoopRefreshObserver;

impl RefreshObserver for NoopRefreshObserver {
    fn on_refresh<'a>(&'a self, _credential: &'a OAuthCredential) -> ObserverFuture<'a> {
        Box::pin(async {})
    }
}

/// Result of a call made under [`OAuthTokenManager::with_auto_refresh`].
#[derive(Debug)]
pub struct Authorized<T> {
    pub value: T,
    /// Credential the successful call used.
    pub credential: OAuthCredential,
    pub refreshed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshTrigger {
    Expired,
    Rejected,
}

enum AuthState {
    Authorized {
        credential: OAuthCredential,
        may_retry: bool,
    },
    Refreshing {
        credential: OAuthCredential,
        trigger: RefreshTrigger,
    },
}

type RefreshSlot = Arc<tokio::sync::Mutex<Option<OAuthCredential>>>;

/// Keeps OAuth credentials usable for the duration of a call.
pub struct OAuthTokenManager {
    refresher: Arc<dyn TokenRefresher>,
    // One slot per refresh token; holding it serialises refreshes of that token.
    inflight: Mutex<HashMap<String, RefreshSlot>>,
}

impl OAuthTokenManager {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `call` with a valid access token.
    ///
    /// An expired credential is refreshed first. If `call` fails with
    /// `auth.unauthorized`, the credential is refreshed once and `call` is
    /// retried once; a second rejection ends in `auth.expired`. Every new
    /// credential is handed to `observer` before it is used.
    pub async fn with_auto_refresh<T, F, Fut>(
        &self,
        credential: OAuthCredential,
        observer: &dyn RefreshObserver,
        mut call: F,
    ) -> Result<Authorized<T>, ApiError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut refreshed = false;
        let mut state = if credential.is_expired() {
            AuthState::Refreshing {
                credential,
                trigger: RefreshTrigger::Expired,
            }
        } else {
            AuthState::Authorized {
                credential,
                may_retry: true,
            }
        };

        loop {
            state = match state {
                AuthState::Refreshing {
                    credential,
                    trigger,
                } => {
                    tracing::debug!(?trigger, "refreshing OAuth access token");
                    let next = self.refresh(&credential).await.map_err(|error| {
                        tracing::warn!(%error, ?trigger, "OAuth token refresh failed");
                        ApiError::from(error)
                    })?;
                    tracing::debug!(expires_at = %next.expires_at, "OAuth access token refreshed");
                    observer.on_refresh(&next).await;
                    refreshed = true;
                    AuthState::Authorized {
                        credential: next,
                        may_retry: trigger == RefreshTrigger::Expired,
                    }
                }
                AuthState::Authorized {
                    credential,
                    may_retry,
                } => match call(credential.access_token.clone()).await {
                    Ok(value) => {
                        return Ok(Authorized {
                            value,
                            credential,
                            refreshed,
                        })
                    }
                    Err(error) if error.kind() == ApiErrorKind::Unauthorized && may_retry => {
                        AuthState::Refreshing {
                            credential,
                            trigger: RefreshTrigger::Rejected,
                        }
                    }
                    Err(error) if error.kind() == ApiErrorKind::Unauthorized => {
                        tracing::warn!("access token rejected again after refresh");
                        return Err(ApiError::auth_expired(format!(
                            "re-consent required: {}",
                            error.message()
                        )));
                    }
                    Err(error) => return Err(error),
                },
            };
        }
    }

    /// Refresh `credential`, reusing a newer credential another caller
    /// already obtained for the same refresh token.
    pub async fn refresh(
        &self,
        credential: &OAuthCredential,
    ) -> Result<OAuthCredential, RefreshError> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or(RefreshError::NoRefreshToken)?;

        let slot = Arc::clone(
            self.registry()
                .entry(refresh_token.clone())
                .or_default(),
        );
        let mut latest = slot.lock().await;

        if let Some(fresh) = latest.as_ref() {
            if fresh.access_token != credential.access_token && !fresh.is_expired() {
                return Ok(fresh.clone());
            }
        }

        let refreshed = self.refresher.refresh(&refresh_token).await;
        self.prune_superseded(&refresh_token);
        let next = credential.refreshed(refreshed?, UtcDateTime::now());
        *latest = Some(next.clone());
        Ok(next)
    }

    /// Drop idle slots that can no longer be reused: empty ones, expired
    /// ones, and those whose credential was itself just refreshed through
    /// `current` (a rotated refresh token chain keeps only its newest link).
    fn prune_superseded(&self, current: &str) {
        self.registry().retain(|key, slot| {
            if key == current || Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(stored) => stored.as_ref().is_some_and(|credential| {
                    !credential.is_expired()
                        && credential.refresh_token.as_deref() != Some(current)
                }),
                Err(_) => true,
            }
        });
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, RefreshSlot>> {
        self.inflight
            .lock()
            .expect("oauth refresh registry should not be poisoned")
    }

    #[cfg(test)]
    fn registry_len(&self) -> usize {
        self.registry().len()
    }
}

impl Debug for OAuthTokenManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::http_client::{HttpResponse, MockHttpClient};

    struct CountingRefresher {
        calls: AtomicUsize,
        rotate_refresh_token: bool,
    }

    impl TokenRefresher for CountingRefresher {
        fn refresh<'a>(&'a self, _refresh_token: &'a str) -> RefreshFuture<'a> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let rotate = self.rotate_refresh_token;
            Box::pin(async move {
                Ok(RefreshedToken {
                    access_token: format!("access-{call}"),
                    expires_in_secs: 3_600,
                    refresh_token: rotate.then(|| format!("refresh-{call}")),
                    scope: None,
                })
            })
        }
    }

    fn counting(rotate: bool) -> Arc<CountingRefresher> {
        Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            rotate_refresh_token: rotate,
        })
    }

    fn credential(expires_in: time::Duration) -> OAuthCredential {
        OAuthCredential {
            access_token: String::from("access-0"),
            refresh_token: Some(String::from("refresh-0")),
            expires_at: UtcDateTime::now().saturating_add(expires_in),
            scope: String::from("youtube.readonly"),
        }
    }

    #[test]
    fn expiry_includes_five_minute_skew() {
        let now = UtcDateTime::parse("2024-05-01T12:00:00Z").expect("now");
        let mut credential = credential(time::Duration::ZERO);
        credential.expires_at = UtcDateTime::parse("2024-05-01T12:05:00Z").expect("exp");
        assert!(!credential.is_expired_at(now));
        credential.expires_at = UtcDateTime::parse("2024-05-01T12:04:59Z").expect("exp");
        assert!(credential.is_expired_at(now));
    }

    #[test]
    fn refresh_keeps_refresh_token_unless_rotated() {
        let now = UtcDateTime::parse("2024-05-01T12:00:00Z").expect("now");
        let base = credential(time::Duration::HOUR);
        let kept = base.refreshed(
            RefreshedToken {
                access_token: String::from("new"),
                expires_in_secs: 60,
                refresh_token: None,
                scope: None,
            },
            now,
        );
        assert_eq!(kept.refresh_token.as_deref(), Some("refresh-0"));
        assert_eq!(kept.scope, "youtube.readonly");
        assert_eq!(
            kept.expires_at,
            UtcDateTime::parse("2024-05-01T12:01:00Z").expect("exp")
        );

        let rotated = base.refreshed(
            RefreshedToken {
                access_token: String::from("new"),
                expires_in_secs: 60,
                refresh_token: Some(String::from("refresh-9")),
                scope: None,
            },
            now,
        );
        assert_eq!(rotated.refresh_token.as_deref(), Some("refresh-9"));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let rendered = format!("{:?}", credential(time::Duration::HOUR));
        assert!(!rendered.contains("access-0"));
        assert!(!rendered.contains("refresh-0"));
    }

    #[tokio::test]
    async fn valid_credential_is_used_without_refreshing() {
        let refresher = counting(false);
        let manager = OAuthTokenManager::new(refresher.clone());

        let outcome = manager
            .with_auto_refresh(
                credential(time::Duration::HOUR),
                &NoopRefreshObserver,
                |token| async move { Ok::<_, ApiError>(token) },
            )
            .await
            .expect("call succeeds");

        assert_eq!(outcome.value, "access-0");
        assert!(!outcome.refreshed);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_of_one_token_hit_the_endpoint_once() {
        let refresher = counting(false);
        let manager = Arc::new(OAuthTokenManager::new(refresher.clone()));
        let stale = credential(time::Duration::HOUR);

        let (a, b) = tokio::join!(manager.refresh(&stale), manager.refresh(&stale));
        assert_eq!(a.expect("first").access_token, "access-1");
        assert_eq!(b.expect("second").access_token, "access-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotating_refresh_tokens_keep_one_registry_slot() {
        let refresher = counting(true);
        let manager = OAuthTokenManager::new(refresher.clone());
        let mut current = credential(time::Duration::HOUR);

        for _ in 0..100 {
            current = manager.refresh(&current).await.expect("refresh");
            assert!(manager.registry_len() <= 1);
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 100);
        assert_eq!(current.refresh_token.as_deref(), Some("refresh-100"));
    }

    #[tokio::test]
    async fn stale_holder_reuses_the_refresh_made_before_it() {
        let refresher = counting(true);
        let manager = OAuthTokenManager::new(refresher.clone());
        let stale = credential(time::Duration::HOUR);

        let first = manager.refresh(&stale).await.expect("first");
        let second = manager.refresh(&stale).await.expect("second");

        assert_eq!(first.access_token, second.access_token);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_with_auth_expired() {
        let manager = OAuthTokenManager::new(counting(false));
        let mut expired = credential(time::Duration::ZERO);
        expired.refresh_token = None;

        let error = manager
            .with_auto_refresh(expired, &NoopRefreshObserver, |_| async {
                Ok::<_, ApiError>(())
            })
            .await
            .expect_err("cannot refresh");
        assert_eq!(error.code(), "auth.expired");
    }

    #[tokio::test]
    async fn http_refresher_posts_form_and_parses_token() {
        let http = MockHttpClient::new(|request| {
            let body = request.body.as_deref().unwrap_or_default();
            assert!(body.contains("grant_type=refresh_token"));
            Ok(HttpResponse::ok_json(
                r#"{"access_token":"fresh","expires_in":1800,"token_type":"Bearer"}"#,
            ))
        });
        let refresher = HttpTokenRefresher::new(
            Arc::new(http.clone()),
            "https://oauth.example.test/token",
            "client",
            "secret",
        );

        let token = refresher.refresh("refresh-0").await.expect("refresh");
        assert_eq!(token.access_token, "fresh");
        assert_eq!(token.expires_in_secs, 1_800);
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn http_refresher_surfaces_provider_error_detail() {
        let http = MockHttpClient::always(
            400,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        let refresher =
            HttpTokenRefresher::new(Arc::new(http), "https://oauth.example.test/token", "c", "s");

        let error = refresher.refresh("refresh-0").await.expect_err("rejected");
        assert_eq!(
            error,
            RefreshError::Rejected {
                status: 400,
                message: String::from("invalid_grant: Token has been expired or revoked."),
            }
        );
    }
}
