use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed job parameters, rejected before a job exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "invalid operation type '{value}', expected one of SEARCH, VIDEO_DETAILS, CHANNEL_DETAILS, PLAYLIST_ITEMS, VIDEO_STATS"
    )]
    InvalidOperationType { value: String },
    #[error("priority must be between 1 (critical) and 4 (low): {value}")]
    InvalidPriority { value: u8 },

    #[error("search query cannot be empty")]
    EmptyQuery,
    #[error("search query length {len} exceeds max {max}")]
    QueryTooLong { len: usize, max: usize },
    #[error("max_results must be between 1 and {max}: {value}")]
    MaxResultsOutOfRange { value: u32, max: u32 },
    #[error(
        "invalid search order '{value}', expected one of relevance, date, viewCount, rating, title"
    )]
    InvalidSearchOrder { value: String },
    #[error("invalid resource kind '{value}', expected one of video, channel, playlist")]
    InvalidResourceKind { value: String },

    #[error("resource id list cannot be empty")]
    EmptyResourceIds,
    #[error("resource id list length {len} exceeds max {max}")]
    TooManyResourceIds { len: usize, max: usize },
    #[error("resource id contains invalid characters: '{value}'")]
    InvalidResourceId { value: String },
    #[error("playlist id cannot be empty")]
    EmptyPlaylistId,

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
}

/// Caller-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    QuotaExceeded,
    Validation,
    Upstream,
    Timeout,
    Transport,
    Unauthorized,
    AuthExpired,
    CacheUnavailable,
    Internal,
}

/// Structured error surfaced at enqueue time or through job status.
///
/// Messages carry the provider's own diagnostic text where there is one, and
/// never credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    kind: ApiErrorKind,
    message: String,
    status: Option<u16>,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl ApiError {
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::QuotaExceeded,
            message: message.into(),
            status: None,
            retryable: false,
            retry_after: None,
        }
    }

    pub fn validation(error: &ValidationError) -> Self {
        Self {
            kind: ApiErrorKind::Validation,
            message: error.to_string(),
            status: None,
            retryable: false,
            retry_after: None,
        }
    }

    /// Provider answered with a non-success status.
    ///
    /// 429 and 5xx are retryable; every other status is not.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Upstream,
            message: message.into(),
            status: Some(status),
            retryable: status == 429 || status >= 500,
            retry_after: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized,
            message: message.into(),
            status: Some(401),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::AuthExpired,
            message: message.into(),
            status: None,
            retryable: false,
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Timeout,
            message: message.into(),
            status: None,
            retryable: true,
            retry_after: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transport,
            message: message.into(),
            status: None,
            retryable: true,
            retry_after: None,
        }
    }

    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::CacheUnavailable,
            message: message.into(),
            status: None,
            retryable: true,
            retry_after: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Internal,
            message: message.into(),
            status: None,
            retryable: false,
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub const fn kind(&self) -> ApiErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ApiErrorKind::QuotaExceeded => "quota.exceeded",
            ApiErrorKind::Validation => "request.invalid",
            ApiErrorKind::Upstream => "upstream.error",
            ApiErrorKind::Timeout => "upstream.timeout",
            ApiErrorKind::Transport => "upstream.transport",
            ApiErrorKind::Unauthorized => "auth.unauthorized",
            ApiErrorKind::AuthExpired => "auth.expired",
            ApiErrorKind::CacheUnavailable => "cache.unavailable",
            ApiErrorKind::Internal => "internal",
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind,
            code: self.code(),
            message: self.message.clone(),
            status: self.status,
            retry_after_secs: self.retry_after.map(|delay| delay.as_secs()),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} [{status}] ({})", self.message, self.code()),
            None => write!(f, "{} ({})", self.message, self.code()),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        Self::validation(&error)
    }
}

/// Serializable view of an [`ApiError`] handed to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ApiErrorKind,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_retryability_follows_status_class() {
        assert!(ApiError::upstream(500, "backend error").retryable());
        assert!(ApiError::upstream(503, "unavailable").retryable());
        assert!(ApiError::upstream(429, "slow down").retryable());
        assert!(!ApiError::upstream(400, "bad request").retryable());
        assert!(!ApiError::upstream(404, "not found").retryable());
    }

    #[test]
    fn report_keeps_provider_message_and_status() {
        let error = ApiError::upstream(400, "Invalid value for parameter id")
            .with_retry_after(Duration::from_secs(30));
        let report = error.report();

        assert_eq!(report.code, "upstream.error");
        assert_eq!(report.message, "Invalid value for parameter id");
        assert_eq!(report.status, Some(400));
        assert_eq!(report.retry_after_secs, Some(30));
    }

    #[test]
    fn validation_errors_convert_to_request_invalid() {
        let error = ApiError::from(ValidationError::EmptyQuery);
        assert_eq!(error.kind(), ApiErrorKind::Validation);
        assert_eq!(error.code(), "request.invalid");
        assert!(!error.retryable());
    }
}
