use std::time::Duration;

use crate::domain::OperationType;

/// Time-to-live per operation type.
///
/// Empty results use the same TTL as non-empty ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtlPolicy {
    pub search: Duration,
    pub video_details: Duration,
    pub channel_details: Duration,
    pub playlist_items: Duration,
    pub video_stats: Duration,
}

impl Default for CacheTtlPolicy {
    fn default() -> Self {
        Self {
            search: Duration::from_secs(300),
            video_details: Duration::from_secs(600),
            channel_details: Duration::from_secs(3_600),
            playlist_items: Duration::from_secs(600),
            video_stats: Duration::from_secs(600),
        }
    }
}

impl CacheTtlPolicy {
    /// Same TTL for every operation.
    pub const fn uniform(ttl: Duration) -> Self {
        Self {
            search: ttl,
            video_details: ttl,
            channel_details: ttl,
            playlist_items: ttl,
            video_stats: ttl,
        }
    }

    pub const fn ttl_for(&self, operation: OperationType) -> Duration {
        match operation {
            OperationType::Search => self.search,
            OperationType::VideoDetails => self.video_details,
            OperationType::ChannelDetails => self.channel_details,
            OperationType::PlaylistItems => self.playlist_items,
            OperationType::VideoStats => self.video_stats,
        }
    }
}
