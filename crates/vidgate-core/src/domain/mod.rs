mod duration;
mod models;
mod operation;
mod params;
mod timestamp;

pub use duration::parse_iso8601_duration;
pub use models::{
    ChannelDetails, JobOutput, Page, PlaylistItem, ResourceBatch, SearchHit, VideoDetails,
    VideoStatistics, VideoStats,
};
pub use operation::{OperationType, Priority};
pub use params::{
    resource_cache_key, JobParams, PlaylistPage, ResourceIds, ResourceKind, SearchOrder,
    SearchParams, MAX_PAGE_SIZE, MAX_RESOURCE_IDS,
};
pub use timestamp::UtcDateTime;
