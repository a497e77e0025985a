use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{OperationType, UtcDateTime};
use crate::ValidationError;

/// Provider maximum for `maxResults` on paged listings.
pub const MAX_PAGE_SIZE: u32 = 50;
/// Upper bound on ids accepted in one job; they are fetched in chunks.
pub const MAX_RESOURCE_IDS: usize = 1_000;
const MAX_QUERY_LEN: usize = 500;

/// Parameters of a job, one variant per operation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation_type", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobParams {
    Search(SearchParams),
    VideoDetails(ResourceIds),
    ChannelDetails(ResourceIds),
    PlaylistItems(PlaylistPage),
    VideoStats(ResourceIds),
}

impl JobParams {
    pub const fn operation_type(&self) -> OperationType {
        match self {
            Self::Search(_) => OperationType::Search,
            Self::VideoDetails(_) => OperationType::VideoDetails,
            Self::ChannelDetails(_) => OperationType::ChannelDetails,
            Self::PlaylistItems(_) => OperationType::PlaylistItems,
            Self::VideoStats(_) => OperationType::VideoStats,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Search(params) => params.validate(),
            Self::PlaylistItems(page) => page.validate(),
            Self::VideoDetails(ids) | Self::ChannelDetails(ids) | Self::VideoStats(ids) => {
                ids.validate()
            }
        }
    }

    pub const fn resource_ids(&self) -> Option<&ResourceIds> {
        match self {
            Self::VideoDetails(ids) | Self::ChannelDetails(ids) | Self::VideoStats(ids) => {
                Some(ids)
            }
            Self::Search(_) | Self::PlaylistItems(_) => None,
        }
    }

    /// Number of billable resources: ids for lookups, one page otherwise.
    pub fn resource_count(&self) -> usize {
        self.resource_ids().map_or(1, ResourceIds::len)
    }

    /// Whole-response cache key for paged operations.
    ///
    /// Batched lookups are cached per id instead, see [`resource_cache_key`].
    pub fn cache_key(&self) -> Option<String> {
        match self {
            Self::Search(params) => Some(params.cache_key()),
            Self::PlaylistItems(page) => Some(page.cache_key()),
            Self::VideoDetails(_) | Self::ChannelDetails(_) | Self::VideoStats(_) => None,
        }
    }
}

/// Cache key of one resource fetched by a batched lookup.
pub fn resource_cache_key(operation: OperationType, id: &str) -> String {
    format!("{}:{id}", operation.cache_prefix())
}

/// Search ordering accepted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchOrder {
    #[serde(rename = "relevance")]
    Relevance,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "viewCount")]
    ViewCount,
    #[serde(rename = "rating")]
    Rating,
    #[serde(rename = "title")]
    Title,
}

impl SearchOrder {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::Date => "date",
            Self::ViewCount => "viewCount",
            Self::Rating => "rating",
            Self::Title => "title",
        }
    }
}

impl FromStr for SearchOrder {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relevance" => Ok(Self::Relevance),
            "date" => Ok(Self::Date),
            "viewcount" | "view_count" => Ok(Self::ViewCount),
            "rating" => Ok(Self::Rating),
            "title" => Ok(Self::Title),
            other => Err(ValidationError::InvalidSearchOrder {
                value: other.to_owned(),
            }),
        }
    }
}

/// Kind of resource a search hit or filter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Video,
    Channel,
    Playlist,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Channel => "channel",
            Self::Playlist => "playlist",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Provider kinds look like "youtube#video".
        let trimmed = value.trim();
        let bare = trimmed.rsplit('#').next().unwrap_or(trimmed);
        match bare.to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "channel" => Ok(Self::Channel),
            "playlist" => Ok(Self::Playlist),
            _ => Err(ValidationError::InvalidResourceKind {
                value: trimmed.to_owned(),
            }),
        }
    }
}

/// Query plus filters for a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default = "default_search_page_size")]
    pub max_results: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SearchOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_after: Option<UtcDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<ResourceKind>,
}

fn default_search_page_size() -> u32 {
    25
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: default_search_page_size(),
            order: None,
            channel_id: None,
            published_after: None,
            resource_kind: None,
        }
    }

    #[must_use]
    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: SearchOrder) -> Self {
        self.order = Some(order);
        self
    }

    #[must_use]
    pub fn with_channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    #[must_use]
    pub fn with_published_after(mut self, published_after: UtcDateTime) -> Self {
        self.published_after = Some(published_after);
        self
    }

    #[must_use]
    pub fn with_resource_kind(mut self, kind: ResourceKind) -> Self {
        self.resource_kind = Some(kind);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        if query.len() > MAX_QUERY_LEN {
            return Err(ValidationError::QueryTooLong {
                len: query.len(),
                max: MAX_QUERY_LEN,
            });
        }
        validate_page_size(self.max_results)?;
        if let Some(channel_id) = &self.channel_id {
            validate_resource_id(channel_id)?;
        }
        Ok(())
    }

    /// Query lowercased with whitespace collapsed, so trivially different
    /// spellings share one cache entry.
    pub fn normalized_query(&self) -> String {
        self.query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn cache_key(&self) -> String {
        let mut key = format!(
            "{}:q={}:max={}",
            OperationType::Search.cache_prefix(),
            self.normalized_query(),
            self.max_results
        );
        if let Some(order) = self.order {
            key.push_str(":order=");
            key.push_str(order.as_str());
        }
        if let Some(channel_id) = &self.channel_id {
            key.push_str(":channel=");
            key.push_str(channel_id);
        }
        if let Some(after) = self.published_after {
            key.push_str(":after=");
            key.push_str(&after.format_rfc3339());
        }
        if let Some(kind) = self.resource_kind {
            key.push_str(":type=");
            key.push_str(kind.as_str());
        }
        key
    }
}

/// Validated, de-duplicated list of resource ids in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ResourceIds(Vec<String>);

impl ResourceIds {
    pub fn new<I, S>(ids: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for id in ids {
            let id = id.into().trim().to_owned();
            validate_resource_id(&id)?;
            if seen.insert(id.clone()) {
                unique.push(id);
            }
        }

        let ids = Self(unique);
        ids.validate()?;
        Ok(ids)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Err(ValidationError::EmptyResourceIds);
        }
        if self.0.len() > MAX_RESOURCE_IDS {
            return Err(ValidationError::TooManyResourceIds {
                len: self.0.len(),
                max: MAX_RESOURCE_IDS,
            });
        }
        self.0.iter().try_for_each(|id| validate_resource_id(id))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for ResourceIds {
    type Error = ValidationError;

    fn try_from(ids: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(ids)
    }
}

impl From<ResourceIds> for Vec<String> {
    fn from(ids: ResourceIds) -> Self {
        ids.0
    }
}

/// One page of a playlist listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistPage {
    pub playlist_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    #[serde(default = "default_playlist_page_size")]
    pub max_results: u32,
}

fn default_playlist_page_size() -> u32 {
    MAX_PAGE_SIZE
}

impl PlaylistPage {
    pub fn new(playlist_id: impl Into<String>) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            page_token: None,
            max_results: default_playlist_page_size(),
        }
    }

    #[must_use]
    pub fn with_page_token(mut self, page_token: impl Into<String>) -> Self {
        self.page_token = Some(page_token.into());
        self
    }

    #[must_use]
    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.playlist_id.trim().is_empty() {
            return Err(ValidationError::EmptyPlaylistId);
        }
        validate_resource_id(self.playlist_id.trim())?;
        validate_page_size(self.max_results)
    }

    fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            OperationType::PlaylistItems.cache_prefix(),
            self.playlist_id.trim(),
            self.page_token.as_deref().unwrap_or("first"),
            self.max_results
        )
    }
}

fn validate_page_size(value: u32) -> Result<(), ValidationError> {
    if value == 0 || value > MAX_PAGE_SIZE {
        return Err(ValidationError::MaxResultsOutOfRange {
            value,
            max: MAX_PAGE_SIZE,
        });
    }
    Ok(())
}

fn validate_resource_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidResourceId {
            value: id.to_owned(),
        })
    }
}
