//! Gateway configuration assembled from the environment.

use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheTtlPolicy;
use crate::client::DEFAULT_BASE_URL;
use crate::quota::DailyReset;

pub const DEFAULT_DAILY_QUOTA: u64 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name} ('{value}'): {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("{name} must be set when {because} is set")]
    MissingValue {
        name: &'static str,
        because: &'static str,
    },
}

/// OAuth client used to refresh access tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub api_base_url: String,
    /// Used for callers without an owner-specific credential.
    pub api_key: Option<String>,
    /// Shared cache tier; local-only caching when absent.
    pub cache_url: Option<String>,
    pub daily_quota: u64,
    pub quota_reset: DailyReset,
    pub ttl: CacheTtlPolicy,
    pub request_timeout: Duration,
    pub oauth_client: Option<OAuthClientConfig>,
    pub home: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::from(DEFAULT_BASE_URL),
            api_key: None,
            cache_url: None,
            daily_quota: DEFAULT_DAILY_QUOTA,
            quota_reset: DailyReset::default(),
            ttl: CacheTtlPolicy::default(),
            request_timeout: Duration::from_millis(10_000),
            oauth_client: None,
            home: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let ttl = CacheTtlPolicy {
            search: secs(&get, "VIDGATE_TTL_SEARCH_SECS", defaults.ttl.search)?,
            video_details: secs(&get, "VIDGATE_TTL_VIDEO_SECS", defaults.ttl.video_details)?,
            channel_details: secs(&get, "VIDGATE_TTL_CHANNEL_SECS", defaults.ttl.channel_details)?,
            playlist_items: secs(&get, "VIDGATE_TTL_PLAYLIST_SECS", defaults.ttl.playlist_items)?,
            video_stats: secs(&get, "VIDGATE_TTL_STATS_SECS", defaults.ttl.video_stats)?,
        };

        let daily_quota = match get("VIDGATE_DAILY_QUOTA") {
            Some(value) => value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: "VIDGATE_DAILY_QUOTA",
                value,
                reason: "expected a whole number of units",
            })?,
            None => defaults.daily_quota,
        };

        let quota_reset = match get("VIDGATE_QUOTA_RESET_UTC") {
            Some(value) => DailyReset::parse(&value).ok_or(ConfigError::InvalidValue {
                name: "VIDGATE_QUOTA_RESET_UTC",
                value,
                reason: "expected HH:MM in UTC",
            })?,
            None => defaults.quota_reset,
        };

        let request_timeout = match get("VIDGATE_REQUEST_TIMEOUT_MS") {
            Some(value) => match value.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "VIDGATE_REQUEST_TIMEOUT_MS",
                        value,
                        reason: "expected a positive number of milliseconds",
                    })
                }
            },
            None => defaults.request_timeout,
        };

        Ok(Self {
            api_base_url: get("VIDGATE_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_key: get("VIDGATE_API_KEY").or_else(|| get("YOUTUBE_API_KEY")),
            cache_url: get("VIDGATE_CACHE_URL").or_else(|| get("REDIS_URL")),
            daily_quota,
            quota_reset,
            ttl,
            request_timeout,
            oauth_client: oauth_client(&get)?,
            home: get("VIDGATE_HOME").map(PathBuf::from),
        })
    }

    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_cache_url(mut self, url: impl Into<String>) -> Self {
        self.cache_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_daily_quota(mut self, units: u64) -> Self {
        self.daily_quota = units;
        self
    }

    #[must_use]
    pub fn with_quota_reset(mut self, reset: DailyReset) -> Self {
        self.quota_reset = reset;
        self
    }

    #[must_use]
    pub fn with_ttl_policy(mut self, ttl: CacheTtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_oauth_client(mut self, client: OAuthClientConfig) -> Self {
        self.oauth_client = Some(client);
        self
    }
}

impl Debug for GatewayConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("cache_url", &self.cache_url.as_ref().map(|_| "<configured>"))
            .field("daily_quota", &self.daily_quota)
            .field("quota_reset", &self.quota_reset)
            .field("ttl", &self.ttl)
            .field("request_timeout", &self.request_timeout)
            .field("oauth_client", &self.oauth_client)
            .field("home", &self.home)
            .finish()
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match get(name) {
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                name,
                value,
                reason: "expected a whole number of seconds",
            }),
        None => Ok(default),
    }
}

fn oauth_client(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<OAuthClientConfig>, ConfigError> {
    const TOKEN_URL: &str = "VIDGATE_OAUTH_TOKEN_URL";
    let Some(token_url) = get(TOKEN_URL) else {
        return Ok(None);
    };
    let client_id = get("VIDGATE_OAUTH_CLIENT_ID").ok_or(ConfigError::MissingValue {
        name: "VIDGATE_OAUTH_CLIENT_ID",
        because: TOKEN_URL,
    })?;
    let client_secret = get("VIDGATE_OAUTH_CLIENT_SECRET").ok_or(ConfigError::MissingValue {
        name: "VIDGATE_OAUTH_CLIENT_SECRET",
        because: TOKEN_URL,
    })?;
    Ok(Some(OAuthClientConfig {
        token_url,
        client_id,
        client_secret,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]).expect("defaults");
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.daily_quota, 10_000);
        assert!(config.cache_url.is_none());
    }

    #[test]
    fn fallback_variables_are_honoured() {
        let config = config_from(&[
            ("YOUTUBE_API_KEY", "yt-key"),
            ("REDIS_URL", "redis://cache:6379"),
            ("VIDGATE_TTL_SEARCH_SECS", "60"),
            ("VIDGATE_QUOTA_RESET_UTC", "07:30"),
        ])
        .expect("config");
        assert_eq!(config.api_key.as_deref(), Some("yt-key"));
        assert_eq!(config.cache_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.ttl.search, Duration::from_secs(60));
        assert_eq!(config.quota_reset, DailyReset::new(7, 30).expect("reset"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let error = config_from(&[("VIDGATE_DAILY_QUOTA", "lots")]).expect_err("invalid");
        assert!(matches!(
            error,
            ConfigError::InvalidValue { name: "VIDGATE_DAILY_QUOTA", .. }
        ));

        let error = config_from(&[("VIDGATE_REQUEST_TIMEOUT_MS", "0")]).expect_err("invalid");
        assert!(error.to_string().contains("VIDGATE_REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn partial_oauth_client_is_rejected() {
        let error = config_from(&[("VIDGATE_OAUTH_TOKEN_URL", "https://oauth.example.test/token")])
            .expect_err("incomplete");
        assert_eq!(
            error,
            ConfigError::MissingValue {
                name: "VIDGATE_OAUTH_CLIENT_ID",
                because: "VIDGATE_OAUTH_TOKEN_URL",
            }
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = GatewayConfig::default()
            .with_api_key("k-secret")
            .with_oauth_client(OAuthClientConfig {
                token_url: String::from("https://oauth.example.test/token"),
                client_id: String::from("client"),
                client_secret: String::from("s3cr3t"),
            });
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("k-secret"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
