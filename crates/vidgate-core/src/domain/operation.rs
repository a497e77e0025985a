use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Upstream operations the gateway knows how to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Search,
    VideoDetails,
    ChannelDetails,
    PlaylistItems,
    VideoStats,
}

impl OperationType {
    pub const ALL: [Self; 5] = [
        Self::Search,
        Self::VideoDetails,
        Self::ChannelDetails,
        Self::PlaylistItems,
        Self::VideoStats,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "SEARCH",
            Self::VideoDetails => "VIDEO_DETAILS",
            Self::ChannelDetails => "CHANNEL_DETAILS",
            Self::PlaylistItems => "PLAYLIST_ITEMS",
            Self::VideoStats => "VIDEO_STATS",
        }
    }

    /// Prefix used for cache keys of this operation.
    pub const fn cache_prefix(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::VideoDetails => "video_details",
            Self::ChannelDetails => "channel_details",
            Self::PlaylistItems => "playlist_items",
            Self::VideoStats => "video_stats",
        }
    }

    /// Operations whose parameters are a list of resource ids fetched in chunks.
    pub const fn is_batched(self) -> bool {
        matches!(
            self,
            Self::VideoDetails | Self::ChannelDetails | Self::VideoStats
        )
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == normalized)
            .ok_or_else(|| ValidationError::InvalidOperationType {
                value: value.trim().to_owned(),
            })
    }
}

/// Job priority; a lower number is served sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

impl Priority {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn is_lowest(self) -> bool {
        matches!(self, Self::Low)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Critical),
            2 => Ok(Self::High),
            3 => Ok(Self::Normal),
            4 => Ok(Self::Low),
            other => Err(ValidationError::InvalidPriority { value: other }),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.as_u8()
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}
