use serde::{Deserialize, Serialize};

use crate::domain::{ResourceKind, UtcDateTime};

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: ResourceKind,
    pub id: String,
    pub title: String,
    pub description: String,
    pub channel_id: String,
    pub channel_title: String,
    pub published_at: Option<UtcDateTime>,
    pub thumbnail_url: Option<String>,
}

/// Engagement counters of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoStatistics {
    pub view_count: u64,
    /// Hidden by the uploader when absent.
    pub like_count: Option<u64>,
    /// Absent when comments are disabled.
    pub comment_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub channel_id: String,
    pub channel_title: String,
    pub published_at: Option<UtcDateTime>,
    pub duration_seconds: Option<u64>,
    pub tags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub statistics: Option<VideoStatistics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStats {
    pub id: String,
    pub statistics: VideoStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub custom_url: Option<String>,
    pub published_at: Option<UtcDateTime>,
    pub thumbnail_url: Option<String>,
    /// Hidden by the channel owner when absent.
    pub subscriber_count: Option<u64>,
    pub video_count: Option<u64>,
    pub view_count: Option<u64>,
    pub uploads_playlist_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub position: u32,
    pub published_at: Option<UtcDateTime>,
    pub thumbnail_url: Option<String>,
}

/// One page of a paged listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
    pub total_results: Option<u64>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_page_token: None,
            total_results: Some(0),
        }
    }
}

/// Result of a batched id lookup.
///
/// `items` follow the requested id order; ids the provider did not return
/// are listed in `missing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBatch<T> {
    pub items: Vec<T>,
    pub missing: Vec<String>,
}

/// Normalized result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobOutput {
    Search(Page<SearchHit>),
    VideoDetails(ResourceBatch<VideoDetails>),
    ChannelDetails(ResourceBatch<ChannelDetails>),
    PlaylistItems(Page<PlaylistItem>),
    VideoStats(ResourceBatch<VideoStats>),
}

impl JobOutput {
    /// Number of entities carried by the output.
    pub fn item_count(&self) -> usize {
        match self {
            Self::Search(page) => page.items.len(),
            Self::PlaylistItems(page) => page.items.len(),
            Self::VideoDetails(batch) => batch.items.len(),
            Self::ChannelDetails(batch) => batch.items.len(),
            Self::VideoStats(batch) => batch.items.len(),
        }
    }
}
